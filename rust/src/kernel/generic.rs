//! Generic N-state pruning kernel.
//!
//! This is the reference arithmetic: the unrolled nucleotide kernel must
//! reproduce it operation for operation on 4-state inputs.

use ndarray::{ArrayView1, ArrayView3, ArrayViewMut1, ArrayViewMut3, Axis};

use super::transition::TransitionMatrices;
use crate::pattern::PatternInfo;

/// `dst[i] = Σ_j P[i][j] · src[j]`
#[inline]
fn extend_row(p: &[f64], src: ArrayView1<'_, f64>, mut dst: ArrayViewMut1<'_, f64>) {
    let n = src.len();
    for (i, cell) in dst.iter_mut().enumerate() {
        let row = &p[i * n..(i + 1) * n];
        *cell = row
            .iter()
            .zip(src.iter())
            .fold(0.0, |acc, (&pij, &bj)| acc + pij * bj);
    }
}

#[inline]
fn extend_slice(p: &[f64], src: &[f64], dst: &mut [f64]) {
    let n = src.len();
    for (i, cell) in dst.iter_mut().enumerate() {
        let row = &p[i * n..(i + 1) * n];
        *cell = row
            .iter()
            .zip(src)
            .fold(0.0, |acc, (&pij, &bj)| acc + pij * bj);
    }
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
        for (pattern, mut dst) in out_c.outer_iter_mut().enumerate() {
            let (l, r) = info.lookup(pattern);
            let lrow = left_c.index_axis(Axis(0), l);
            let rrow = right_c.index_axis(Axis(0), r);
            for ((cell, &a), &b) in dst.iter_mut().zip(lrow.iter()).zip(rrow.iter()) {
                *cell = a * b;
            }
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
            extend_row(p, src, dst);
        }
    }
}

pub(crate) fn extend_in_place(matrices: &TransitionMatrices, mut store: ArrayViewMut3<'_, f64>) {
    let n_states = store.dim().2;
    let mut src = vec![0.0; n_states];
    let mut dst = vec![0.0; n_states];
    for (c, mut store_c) in store.outer_iter_mut().enumerate() {
        let p = matrices.category(c);
        for mut row in store_c.outer_iter_mut() {
            for (s, &v) in src.iter_mut().zip(row.iter()) {
                *s = v;
            }
            extend_slice(p, &src, &mut dst);
            for (cell, &v) in row.iter_mut().zip(&dst) {
                *cell = v;
            }
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
    let n_states = out.dim().2;
    let mut product = vec![0.0; n_states];
    let mut extended = vec![0.0; n_states];
    for (c, mut out_c) in out.outer_iter_mut().enumerate() {
        let p = matrices.category(c);
        let left_c = left.index_axis(Axis(0), c);
        let right_c = right.index_axis(Axis(0), c);
        for (pattern, mut dst) in out_c.outer_iter_mut().enumerate() {
            let (l, r) = info.lookup(pattern);
            let lrow = left_c.index_axis(Axis(0), l);
            let rrow = right_c.index_axis(Axis(0), r);
            for ((cell, &a), &b) in product.iter_mut().zip(lrow.iter()).zip(rrow.iter()) {
                *cell = a * b;
            }
            extend_slice(p, &product, &mut extended);
            for (cell, &v) in dst.iter_mut().zip(&extended) {
                *cell = v;
            }
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
    let n_states = out.dim().2;
    let mut src = vec![0.0; n_states];
    let mut left_ext = vec![0.0; n_states];
    let mut right_ext = vec![0.0; n_states];
    for (c, mut out_c) in out.outer_iter_mut().enumerate() {
        let lp = left_matrices.category(c);
        let rp = right_matrices.category(c);
        let left_c = left.index_axis(Axis(0), c);
        let right_c = right.index_axis(Axis(0), c);
        for (pattern, mut dst) in out_c.outer_iter_mut().enumerate() {
            let (l, r) = info.lookup(pattern);
            for (s, &v) in src.iter_mut().zip(left_c.index_axis(Axis(0), l).iter()) {
                *s = v;
            }
            extend_slice(lp, &src, &mut left_ext);
            for (s, &v) in src.iter_mut().zip(right_c.index_axis(Axis(0), r).iter()) {
                *s = v;
            }
            extend_slice(rp, &src, &mut right_ext);
            for ((cell, &a), &b) in dst.iter_mut().zip(&left_ext).zip(&right_ext) {
                *cell = a * b;
            }
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
    let weights = info.weights();
    let mut total = 0.0;
    for (pattern, &weight) in weights.iter().enumerate() {
        let (l, r) = info.lookup(pattern);
        let mut site = 0.0;
        for (c, &cat_p) in category_probabilities.iter().enumerate() {
            let lrow = left.index_axis(Axis(0), c);
            let lrow = lrow.index_axis(Axis(0), l);
            let rrow = right.index_axis(Axis(0), c);
            let rrow = rrow.index_axis(Axis(0), r);
            let sum = frequencies
                .iter()
                .zip(lrow.iter())
                .zip(rrow.iter())
                .fold(0.0, |acc, ((&f, &a), &b)| acc + f * a * b);
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
    let mut total = 0.0;
    for (pattern, &weight) in weights.iter().enumerate() {
        let mut site = 0.0;
        for (c, &cat_p) in category_probabilities.iter().enumerate() {
            let row = root.index_axis(Axis(0), c);
            let row = row.index_axis(Axis(0), pattern);
            let sum = frequencies
                .iter()
                .zip(row.iter())
                .fold(0.0, |acc, (&f, &a)| acc + f * a);
            site += cat_p * sum;
        }
        total += weight as f64 * site.ln();
    }
    total
}
