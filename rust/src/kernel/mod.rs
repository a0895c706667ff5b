//! Felsenstein pruning kernels.
//!
//! Four operations make up the whole capability set:
//! - flat: elementwise product of two child conditionals, pattern by pattern
//! - extend: push a conditional vector across a branch, `ext[i] = Σ_j P[i][j]·base[j]`
//! - fused flat-then-extend / extend-then-flat, numerically identical to the pair
//! - log-likelihood: weighted sum over patterns of `ln Σ_c w_c Σ_s π_s·left·right`
//!
//! [`Kernel`] picks the arithmetic (generic or unrolled 4-state). The
//! calculators wrap it with or without a per-branch matrix cache.

mod generic;
mod leaf;
mod nucleotide;
mod transition;

pub use leaf::LeafCalculator;
pub use transition::{TransitionCache, TransitionMatrices};

use crate::error::{LikelihoodError, Result};
use crate::model::SubstitutionModel;
use crate::pattern::{LeafPatterns, PatternInfo};
use crate::store::ConditionalStore;

/// Numeric specialisation of the pruning arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kernel {
    /// Any state count.
    Generic,
    /// Exactly four states, loops unrolled.
    Nucleotide,
}

fn check_states(kernel: Kernel, n_states: usize) -> Result<()> {
    if kernel == Kernel::Nucleotide && n_states != 4 {
        return Err(LikelihoodError::config(format!(
            "nucleotide kernel used with {} states",
            n_states
        )));
    }
    Ok(())
}

fn check_same_shape(a: &ConditionalStore, b: &ConditionalStore) -> Result<()> {
    if !a.matches_shape(b.n_categories(), b.n_states()) {
        return Err(LikelihoodError::model(format!(
            "store shapes differ: {}x{} vs {}x{}",
            a.n_categories(),
            a.n_states(),
            b.n_categories(),
            b.n_states()
        )));
    }
    Ok(())
}

fn check_matrices(matrices: &TransitionMatrices, store: &ConditionalStore) -> Result<()> {
    if matrices.n_categories() != store.n_categories() || matrices.n_states() != store.n_states() {
        return Err(LikelihoodError::model(format!(
            "transition matrices are {}x{}, store is {}x{}",
            matrices.n_categories(),
            matrices.n_states(),
            store.n_categories(),
            store.n_states()
        )));
    }
    Ok(())
}

fn check_model(model: &dyn SubstitutionModel, store: &ConditionalStore) -> Result<()> {
    if model.n_categories() != store.n_categories() || model.n_states() != store.n_states() {
        return Err(LikelihoodError::model(format!(
            "model is {}x{}, conditionals are {}x{}",
            model.n_categories(),
            model.n_states(),
            store.n_categories(),
            store.n_states()
        )));
    }
    Ok(())
}

fn check_built(info: &PatternInfo) -> Result<()> {
    if !info.has_lookup() {
        return Err(LikelihoodError::EmptyPatterns { side: "parent" });
    }
    Ok(())
}

impl Kernel {
    /// `out[c][p] = left[c][l(p)] ⊙ right[c][r(p)]` for every pattern of `info`.
    pub fn flat(
        self,
        info: &PatternInfo,
        left: &ConditionalStore,
        right: &ConditionalStore,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        check_built(info)?;
        check_states(self, out.n_states())?;
        check_same_shape(left, out)?;
        check_same_shape(right, out)?;
        let (nl, nr) = info.child_pattern_counts();
        let left = left.patterns_for_read(nl)?;
        let right = right.patterns_for_read(nr)?;
        let out = out.get_for_write(info.n_patterns(), based_on_cached)?;
        match self {
            Kernel::Generic => generic::flat(info, left, right, out),
            Kernel::Nucleotide => nucleotide::flat(info, left, right, out),
        }
        Ok(())
    }

    /// Extend the first `n_patterns` rows of `base` into `out`.
    pub fn extend(
        self,
        matrices: &TransitionMatrices,
        n_patterns: usize,
        base: &ConditionalStore,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        check_states(self, out.n_states())?;
        check_same_shape(base, out)?;
        check_matrices(matrices, out)?;
        let base = base.patterns_for_read(n_patterns)?;
        let out = out.get_for_write(n_patterns, based_on_cached)?;
        match self {
            Kernel::Generic => generic::extend(matrices, base, out),
            Kernel::Nucleotide => nucleotide::extend(matrices, base, out),
        }
        Ok(())
    }

    /// Extend the first `n_patterns` rows of `store` without a second buffer.
    pub fn extend_in_place(
        self,
        matrices: &TransitionMatrices,
        n_patterns: usize,
        store: &mut ConditionalStore,
    ) -> Result<()> {
        check_states(self, store.n_states())?;
        check_matrices(matrices, store)?;
        let cached = store.is_based_on_cached_data();
        let view = store.get_for_write_no_resize(n_patterns, cached)?;
        match self {
            Kernel::Generic => generic::extend_in_place(matrices, view),
            Kernel::Nucleotide => nucleotide::extend_in_place(matrices, view),
        }
        Ok(())
    }

    /// Flat combination followed by extension, without an intermediate store.
    pub fn flat_then_extend(
        self,
        info: &PatternInfo,
        left: &ConditionalStore,
        right: &ConditionalStore,
        matrices: &TransitionMatrices,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        check_built(info)?;
        check_states(self, out.n_states())?;
        check_same_shape(left, out)?;
        check_same_shape(right, out)?;
        check_matrices(matrices, out)?;
        let (nl, nr) = info.child_pattern_counts();
        let left = left.patterns_for_read(nl)?;
        let right = right.patterns_for_read(nr)?;
        let out = out.get_for_write(info.n_patterns(), based_on_cached)?;
        match self {
            Kernel::Generic => generic::flat_then_extend(info, left, right, matrices, out),
            Kernel::Nucleotide => nucleotide::flat_then_extend(info, left, right, matrices, out),
        }
        Ok(())
    }

    /// Extend both children, then combine them flat.
    #[allow(clippy::too_many_arguments)]
    pub fn extend_then_flat(
        self,
        info: &PatternInfo,
        left: &ConditionalStore,
        left_matrices: &TransitionMatrices,
        right: &ConditionalStore,
        right_matrices: &TransitionMatrices,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        check_built(info)?;
        check_states(self, out.n_states())?;
        check_same_shape(left, out)?;
        check_same_shape(right, out)?;
        check_matrices(left_matrices, out)?;
        check_matrices(right_matrices, out)?;
        let (nl, nr) = info.child_pattern_counts();
        let left = left.patterns_for_read(nl)?;
        let right = right.patterns_for_read(nr)?;
        let out = out.get_for_write(info.n_patterns(), based_on_cached)?;
        match self {
            Kernel::Generic => {
                generic::extend_then_flat(info, left, left_matrices, right, right_matrices, out)
            }
            Kernel::Nucleotide => {
                nucleotide::extend_then_flat(info, left, left_matrices, right, right_matrices, out)
            }
        }
        Ok(())
    }

    /// Log-likelihood of two conditionals meeting at one point.
    ///
    /// A pattern with zero total probability contributes `-inf`.
    pub fn log_likelihood(
        self,
        model: &dyn SubstitutionModel,
        info: &PatternInfo,
        left: &ConditionalStore,
        right: &ConditionalStore,
    ) -> Result<f64> {
        check_built(info)?;
        check_states(self, model.n_states())?;
        check_model(model, left)?;
        check_model(model, right)?;
        let (nl, nr) = info.child_pattern_counts();
        let left = left.patterns_for_read(nl)?;
        let right = right.patterns_for_read(nr)?;
        let freqs = model.equilibrium_frequencies();
        let cats = model.category_probabilities();
        Ok(match self {
            Kernel::Generic => generic::log_likelihood(freqs, cats, info, left, right),
            Kernel::Nucleotide => nucleotide::log_likelihood(freqs, cats, info, left, right),
        })
    }

    /// Log-likelihood from fully combined root conditionals.
    pub fn log_likelihood_single(
        self,
        model: &dyn SubstitutionModel,
        weights: &[u32],
        root: &ConditionalStore,
    ) -> Result<f64> {
        check_states(self, model.n_states())?;
        check_model(model, root)?;
        let root = root.patterns_for_read(weights.len())?;
        let freqs = model.equilibrium_frequencies();
        let cats = model.category_probabilities();
        Ok(match self {
            Kernel::Generic => generic::log_likelihood_single(freqs, cats, weights, root),
            Kernel::Nucleotide => nucleotide::log_likelihood_single(freqs, cats, weights, root),
        })
    }
}

/// Stateful calculator: remembers the last distance and its matrices.
///
/// Not safe to share; one instance belongs to one branch.
#[derive(Clone, Debug)]
pub struct InternalCalculator {
    kernel: Kernel,
    transitions: TransitionCache,
}

impl InternalCalculator {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            transitions: TransitionCache::new(),
        }
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    /// Matrices for `distance`, recomputed only if distance or model changed.
    pub fn matrices(
        &mut self,
        model: &dyn SubstitutionModel,
        distance: f64,
        tolerance: f64,
    ) -> &TransitionMatrices {
        self.transitions.update(model, distance, tolerance);
        self.transitions.matrices()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn extend(
        &mut self,
        model: &dyn SubstitutionModel,
        distance: f64,
        tolerance: f64,
        n_patterns: usize,
        base: &ConditionalStore,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        let kernel = self.kernel;
        let matrices = self.matrices(model, distance, tolerance);
        kernel.extend(matrices, n_patterns, base, out, based_on_cached)
    }

    pub fn transitions(&self) -> &TransitionCache {
        &self.transitions
    }

    pub fn invalidate(&mut self) {
        self.transitions.invalidate();
    }
}

/// Stateless calculator: every call computes its matrices into caller scratch.
///
/// Holds no per-branch state, so one instance can serve any number of trees.
#[derive(Clone, Copy, Debug)]
pub struct ExternalCalculator {
    kernel: Kernel,
}

impl ExternalCalculator {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    #[allow(clippy::too_many_arguments)]
    pub fn extend(
        &self,
        model: &dyn SubstitutionModel,
        distance: f64,
        scratch: &mut TransitionMatrices,
        n_patterns: usize,
        base: &ConditionalStore,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        scratch.compute(model, distance);
        self.kernel
            .extend(scratch, n_patterns, base, out, based_on_cached)
    }

    pub fn extend_leaf(
        &self,
        model: &dyn SubstitutionModel,
        distance: f64,
        scratch: &mut TransitionMatrices,
        leaf: &LeafCalculator,
        out: &mut ConditionalStore,
    ) -> Result<()> {
        scratch.compute(model, distance);
        leaf.extend(scratch, out)
    }

    /// Combine two flat child conditionals, each extended across its own branch.
    #[allow(clippy::too_many_arguments)]
    pub fn extend_then_flat(
        &self,
        model: &dyn SubstitutionModel,
        info: &PatternInfo,
        left: &ConditionalStore,
        left_distance: f64,
        right: &ConditionalStore,
        right_distance: f64,
        scratch: &mut [TransitionMatrices; 2],
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        let [left_m, right_m] = scratch;
        left_m.compute(model, left_distance);
        right_m.compute(model, right_distance);
        self.kernel
            .extend_then_flat(info, left, left_m, right, right_m, out, based_on_cached)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn flat_then_extend(
        &self,
        model: &dyn SubstitutionModel,
        info: &PatternInfo,
        left: &ConditionalStore,
        right: &ConditionalStore,
        distance: f64,
        scratch: &mut TransitionMatrices,
        out: &mut ConditionalStore,
        based_on_cached: bool,
    ) -> Result<()> {
        scratch.compute(model, distance);
        self.kernel
            .flat_then_extend(info, left, right, scratch, out, based_on_cached)
    }
}

/// Calculator owned by one branch: cached or stateless.
#[derive(Clone, Debug)]
pub enum BranchCalculator {
    Internal(InternalCalculator),
    External(ExternalCalculator),
}

impl BranchCalculator {
    pub fn kernel(&self) -> Kernel {
        match self {
            BranchCalculator::Internal(calc) => calc.kernel(),
            BranchCalculator::External(calc) => calc.kernel(),
        }
    }

    /// Matrices at `distance`, from the branch cache or freshly into `scratch`.
    pub fn matrices<'a>(
        &'a mut self,
        model: &dyn SubstitutionModel,
        distance: f64,
        tolerance: f64,
        scratch: &'a mut TransitionMatrices,
    ) -> &'a TransitionMatrices {
        match self {
            BranchCalculator::Internal(calc) => calc.matrices(model, distance, tolerance),
            BranchCalculator::External(_) => {
                scratch.compute(model, distance);
                scratch
            }
        }
    }

    pub fn is_stateless(&self) -> bool {
        matches!(self, BranchCalculator::External(_))
    }

    pub fn invalidate(&mut self) {
        if let BranchCalculator::Internal(calc) = self {
            calc.invalidate();
        }
    }
}

/// Chooses the calculator variant for every branch at construction time.
#[derive(Clone, Copy, Debug)]
pub struct CalculatorFactory {
    kernel: Kernel,
    stateless: bool,
}

impl CalculatorFactory {
    pub fn new(kernel: Kernel, stateless: bool) -> Self {
        Self { kernel, stateless }
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    pub fn branch_calculator(&self) -> BranchCalculator {
        if self.stateless {
            BranchCalculator::External(ExternalCalculator::new(self.kernel))
        } else {
            BranchCalculator::Internal(InternalCalculator::new(self.kernel))
        }
    }

    pub fn external(&self) -> ExternalCalculator {
        ExternalCalculator::new(self.kernel)
    }

    pub fn leaf_calculator(&self, sequence: &[u8], n_states: usize) -> Result<LeafCalculator> {
        Ok(LeafCalculator::new(LeafPatterns::new(sequence, n_states)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{F81, JukesCantor, RateCategories};
    use ndarray::Array3;

    fn store_from(data: Array3<f64>) -> ConditionalStore {
        let (nc, np, ns) = data.dim();
        let mut store = ConditionalStore::new(nc, ns);
        store.get_for_write(np, false).unwrap().assign(&data);
        store
    }

    fn sample_store(nc: usize, np: usize, seed: u64) -> ConditionalStore {
        let data = Array3::from_shape_fn((nc, np, 4), |(c, p, s)| {
            let x = (seed as usize * 31 + c * 17 + p * 7 + s * 3) % 11;
            0.05 + x as f64 / 11.0
        });
        store_from(data)
    }

    fn pair_info() -> PatternInfo {
        let a = LeafPatterns::new(&[0, 1, 2, 0, 1, 3], 4).unwrap();
        let b = LeafPatterns::new(&[1, 1, 2, 3, 0, 3], 4).unwrap();
        PatternInfo::from_children(a.info(), b.info()).unwrap()
    }

    fn assert_close(a: &ConditionalStore, b: &ConditionalStore, n: usize) {
        let a = a.patterns_for_read(n).unwrap();
        let b = b.patterns_for_read(n).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-14, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_flat_is_elementwise_product() {
        let info = pair_info();
        let left = sample_store(1, 4, 1);
        let right = sample_store(1, 4, 2);
        let mut out = ConditionalStore::new(1, 4);
        Kernel::Generic.flat(&info, &left, &right, &mut out, false).unwrap();

        let (l, r) = info.lookup(2);
        let lv = left.get_for_read();
        let rv = right.get_for_read();
        let ov = out.get_for_read();
        for s in 0..4 {
            assert_eq!(ov[[0, 2, s]], lv[[0, l, s]] * rv[[0, r, s]]);
        }
    }

    #[test]
    fn test_kernels_agree() {
        let model = F81::new(vec![0.1, 0.2, 0.3, 0.4])
            .unwrap()
            .with_categories(RateCategories::equal(vec![0.3, 1.7]).unwrap());
        let info = pair_info();
        let n = info.n_patterns();
        let left = sample_store(2, 4, 3);
        let right = sample_store(2, 4, 4);
        let lm = TransitionMatrices::for_distance(&model, 0.13);
        let rm = TransitionMatrices::for_distance(&model, 0.41);

        let mut outs = Vec::new();
        for kernel in [Kernel::Generic, Kernel::Nucleotide] {
            let mut flat = ConditionalStore::new(2, 4);
            kernel.flat(&info, &left, &right, &mut flat, false).unwrap();
            let mut ext = ConditionalStore::new(2, 4);
            kernel.extend(&lm, 4, &left, &mut ext, false).unwrap();
            let mut etf = ConditionalStore::new(2, 4);
            kernel
                .extend_then_flat(&info, &left, &lm, &right, &rm, &mut etf, false)
                .unwrap();
            let ll = kernel.log_likelihood(&model, &info, &left, &right).unwrap();
            outs.push((flat, ext, etf, ll));
        }
        let (g, u) = (&outs[0], &outs[1]);
        assert_close(&g.0, &u.0, n);
        assert_close(&g.1, &u.1, 4);
        assert_close(&g.2, &u.2, n);
        assert!((g.3 - u.3).abs() < 1e-12);
    }

    #[test]
    fn test_fused_matches_sequential() {
        let model = JukesCantor::nucleotide();
        let info = pair_info();
        let n = info.n_patterns();
        let left = sample_store(1, 4, 5);
        let right = sample_store(1, 4, 6);
        let m = TransitionMatrices::for_distance(&model, 0.2);
        let m2 = TransitionMatrices::for_distance(&model, 0.35);

        for kernel in [Kernel::Generic, Kernel::Nucleotide] {
            let mut flat = ConditionalStore::new(1, 4);
            kernel.flat(&info, &left, &right, &mut flat, false).unwrap();
            let mut seq = ConditionalStore::new(1, 4);
            kernel.extend(&m, n, &flat, &mut seq, false).unwrap();
            let mut fused = ConditionalStore::new(1, 4);
            kernel
                .flat_then_extend(&info, &left, &right, &m, &mut fused, false)
                .unwrap();
            assert_close(&seq, &fused, n);

            kernel.extend_in_place(&m, n, &mut flat).unwrap();
            assert_close(&seq, &flat, n);

            let mut le = ConditionalStore::new(1, 4);
            let mut re = ConditionalStore::new(1, 4);
            kernel.extend(&m, 4, &left, &mut le, false).unwrap();
            kernel.extend(&m2, 4, &right, &mut re, false).unwrap();
            let mut seq_flat = ConditionalStore::new(1, 4);
            kernel.flat(&info, &le, &re, &mut seq_flat, false).unwrap();
            let mut fused_flat = ConditionalStore::new(1, 4);
            kernel
                .extend_then_flat(&info, &left, &m, &right, &m2, &mut fused_flat, false)
                .unwrap();
            assert_close(&seq_flat, &fused_flat, n);
        }
    }

    #[test]
    fn test_single_matches_pairwise_with_ones() {
        let model = JukesCantor::nucleotide();
        let a = LeafPatterns::new(&[0, 1, 1, 2], 4).unwrap();
        let ones = LeafPatterns::new(&[255, 255, 255, 255], 4).unwrap();
        let info = PatternInfo::from_children(a.info(), ones.info()).unwrap();

        let mut left = ConditionalStore::new(1, 4);
        LeafCalculator::new(a.clone()).fill_flat(&mut left).unwrap();
        let mut right = ConditionalStore::new(1, 4);
        LeafCalculator::new(ones).fill_flat(&mut right).unwrap();

        let pair = Kernel::Generic
            .log_likelihood(&model, &info, &left, &right)
            .unwrap();
        let single = Kernel::Generic
            .log_likelihood_single(&model, a.info().weights(), &left)
            .unwrap();
        assert!((pair - single).abs() < 1e-12);
        assert!((single - 4.0 * 0.25f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_zero_probability_gives_neg_infinity() {
        let model = JukesCantor::nucleotide();
        let a = LeafPatterns::new(&[0], 4).unwrap();
        let b = LeafPatterns::new(&[1], 4).unwrap();
        let info = PatternInfo::from_children(a.info(), b.info()).unwrap();
        let mut left = ConditionalStore::new(1, 4);
        LeafCalculator::new(a).fill_flat(&mut left).unwrap();
        let mut right = ConditionalStore::new(1, 4);
        LeafCalculator::new(b).fill_flat(&mut right).unwrap();

        // Two different observed states meeting at distance zero.
        let ll = Kernel::Nucleotide
            .log_likelihood(&model, &info, &left, &right)
            .unwrap();
        assert_eq!(ll, f64::NEG_INFINITY);
    }

    #[test]
    fn test_undersized_store_is_rejected() {
        let info = pair_info();
        let left = sample_store(1, 2, 1);
        let right = sample_store(1, 4, 2);
        let mut out = ConditionalStore::new(1, 4);
        let err = Kernel::Generic
            .flat(&info, &left, &right, &mut out, false)
            .unwrap_err();
        assert!(matches!(err, LikelihoodError::PatternCountMismatch { .. }));
    }

    #[test]
    fn test_nucleotide_kernel_rejects_other_state_counts() {
        let model = JukesCantor::new(20).unwrap();
        let m = TransitionMatrices::for_distance(&model, 0.1);
        let base = ConditionalStore::with_capacity(1, 20, 1);
        let mut out = ConditionalStore::new(1, 20);
        assert!(Kernel::Nucleotide.extend(&m, 1, &base, &mut out, false).is_err());
        assert!(Kernel::Generic.extend(&m, 1, &base, &mut out, false).is_ok());
    }

    #[test]
    fn test_internal_calculator_reuses_matrices() {
        let model = JukesCantor::nucleotide();
        let mut calc = InternalCalculator::new(Kernel::Nucleotide);
        let base = sample_store(1, 3, 9);
        let mut out = ConditionalStore::new(1, 4);
        calc.extend(&model, 0.1, 1e-12, 3, &base, &mut out, false).unwrap();
        calc.extend(&model, 0.1, 1e-12, 3, &base, &mut out, false).unwrap();
        assert_eq!(calc.transitions().recomputations(), 1);
        calc.extend(&model, 0.2, 1e-12, 3, &base, &mut out, false).unwrap();
        assert_eq!(calc.transitions().recomputations(), 2);
    }

    #[test]
    fn test_external_matches_internal() {
        let model = JukesCantor::nucleotide();
        let base = sample_store(1, 3, 11);
        let mut internal = InternalCalculator::new(Kernel::Generic);
        let mut a = ConditionalStore::new(1, 4);
        internal.extend(&model, 0.3, 1e-12, 3, &base, &mut a, false).unwrap();

        let external = ExternalCalculator::new(Kernel::Generic);
        let mut scratch = TransitionMatrices::default();
        let mut b = ConditionalStore::new(1, 4);
        external
            .extend(&model, 0.3, &mut scratch, 3, &base, &mut b, false)
            .unwrap();
        assert_close(&a, &b, 3);
    }
}
