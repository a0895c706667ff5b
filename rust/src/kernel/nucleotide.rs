//! Hand-unrolled 4-state kernel.
//!
//! Summation order matches `generic` exactly so the two agree bit for bit on
//! non-negative inputs.

use ndarray::{ArrayView1, ArrayView3, ArrayViewMut1, ArrayViewMut3, Axis};

use super::transition::TransitionMatrices;
use crate::pattern::PatternInfo;

#[inline(always)]
fn load(v: ArrayView1<'_, f64>) -> [f64; 4] {
    [v[0], v[1], v[2], v[3]]
}

#[inline(always)]
fn store(mut v: ArrayViewMut1<'_, f64>, x: [f64; 4]) {
    v[0] = x[0];
    v[1] = x[1];
    v[2] = x[2];
    v[3] = x[3];
}

#[inline(always)]
fn extend4(p: &[f64], b: [f64; 4]) -> [f64; 4] {
    [
        p[0] * b[0] + p[1] * b[1] + p[2] * b[2] + p[3] * b[3],
        p[4] * b[0] + p[5] * b[1] + p[6] * b[2] + p[7] * b[3],
        p[8] * b[0] + p[9] * b[1] + p[10] * b[2] + p[11] * b[3],
        p[12] * b[0] + p[13] * b[1] + p[14] * b[2] + p[15] * b[3],
    ]
}

#[inline(always)]
fn mul4(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    [a[0] * b[0], a[1] * b[1], a[2] * b[2], a[3] * b[3]]
}

pub(crate) fn flat(
    info: &PatternInfo,
    left: ArrayView3<'_, f64>,
    right: ArrayView3<'_, f64>,
    mut out: ArrayViewMut3<'_, f64>,
) {
    for (c, mut out_c) in out.outer_iter_mut().enumerate() {
        let left_c = left.index_axis(Axis(0), c);
        let right_c = right.index_axis(Axis(0), c);
        for (pattern, dst) in out_c.outer_iter_mut().enumerate() {
            let (l, r) = info.lookup(pattern);
            let a = load(left_c.index_axis(Axis(0), l));
            let b = load(right_c.index_axis(Axis(0), r));
            store(dst, mul4(a, b));
        }
    }
}

pub(crate) fn extend(
    matrices: &TransitionMatrices,
    base: ArrayView3<'_, f64>,
    mut out: ArrayViewMut3<'_, f64>,
) {
    for (c, (base_c, mut out_c)) in base.outer_iter().zip(out.outer_iter_mut()).enumerate() {
        let p = matrices.category(c);
        for (src, dst) in base_c.outer_iter().zip(out_c.outer_iter_mut()) {
            store(dst, extend4(p, load(src)));
        }
    }
}

pub(crate) fn extend_in_place(matrices: &TransitionMatrices, mut store_view: ArrayViewMut3<'_, f64>) {
    for (c, mut store_c) in store_view.outer_iter_mut().enumerate() {
        let p = matrices.category(c);
        for mut row in store_c.outer_iter_mut() {
            let b = [row[0], row[1], row[2], row[3]];
            store(row.view_mut(), extend4(p, b));
        }
    }
}

pub(crate) fn flat_then_extend(
    info: &PatternInfo,
    left: ArrayView3<'_, f64>,
    right: ArrayView3<'_, f64>,
    matrices: &TransitionMatrices,
    mut out: ArrayViewMut3<'_, f64>,
) {
    for (c, mut out_c) in out.outer_iter_mut().enumerate() {
        let p = matrices.category(c);
        let left_c = left.index_axis(Axis(0), c);
        let right_c = right.index_axis(Axis(0), c);
        for (pattern, dst) in out_c.outer_iter_mut().enumerate() {
            let (l, r) = info.lookup(pattern);
            let a = load(left_c.index_axis(Axis(0), l));
            let b = load(right_c.index_axis(Axis(0), r));
            store(dst, extend4(p, mul4(a, b)));
        }
    }
}

pub(crate) fn extend_then_flat(
    info: &PatternInfo,
    left: ArrayView3<'_, f64>,
    left_matrices: &TransitionMatrices,
    right: ArrayView3<'_, f64>,
    right_matrices: &TransitionMatrices,
    mut out: ArrayViewMut3<'_, f64>,
) {
    for (c, mut out_c) in out.outer_iter_mut().enumerate() {
        let lp = left_matrices.category(c);
        let rp = right_matrices.category(c);
        let left_c = left.index_axis(Axis(0), c);
        let right_c = right.index_axis(Axis(0), c);
        for (pattern, dst) in out_c.outer_iter_mut().enumerate() {
            let (l, r) = info.lookup(pattern);
            let a = extend4(lp, load(left_c.index_axis(Axis(0), l)));
            let b = extend4(rp, load(right_c.index_axis(Axis(0), r)));
            store(dst, mul4(a, b));
        }
    }
}

pub(crate) fn log_likelihood(
    frequencies: &[f64],
    category_probabilities: &[f64],
    info: &PatternInfo,
    left: ArrayView3<'_, f64>,
    right: ArrayView3<'_, f64>,
) -> f64 {
    let f = [frequencies[0], frequencies[1], frequencies[2], frequencies[3]];
    let mut total = 0.0;
    for (pattern, &weight) in info.weights().iter().enumerate() {
        let (l, r) = info.lookup(pattern);
        let mut site = 0.0;
        for (c, &cat_p) in category_probabilities.iter().enumerate() {
            let a = load(left.index_axis(Axis(0), c).index_axis(Axis(0), l));
            let b = load(right.index_axis(Axis(0), c).index_axis(Axis(0), r));
            let sum = f[0] * a[0] * b[0] + f[1] * a[1] * b[1] + f[2] * a[2] * b[2] + f[3] * a[3] * b[3];
            site += cat_p * sum;
        }
        total += weight as f64 * site.ln();
    }
    total
}

pub(crate) fn log_likelihood_single(
    frequencies: &[f64],
    category_probabilities: &[f64],
    weights: &[u32],
    root: ArrayView3<'_, f64>,
) -> f64 {
    let f = [frequencies[0], frequencies[1], frequencies[2], frequencies[3]];
    let mut total = 0.0;
    for (pattern, &weight) in weights.iter().enumerate() {
        let mut site = 0.0;
        for (c, &cat_p) in category_probabilities.iter().enumerate() {
            let a = load(root.index_axis(Axis(0), c).index_axis(Axis(0), pattern));
            site += cat_p * (f[0] * a[0] + f[1] * a[1] + f[2] * a[2] + f[3] * a[3]);
        }
        total += weight as f64 * site.ln();
    }
    total
}
