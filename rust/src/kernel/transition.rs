//! Per-category transition matrices and the distance cache around them.

use crate::model::SubstitutionModel;

/// One row-major `n_states × n_states` matrix per rate category.
#[derive(Clone, Debug, Default)]
pub struct TransitionMatrices {
    n_categories: usize,
    n_states: usize,
    data: Vec<f64>,
}

impl TransitionMatrices {
    pub fn new(n_categories: usize, n_states: usize) -> Self {
        Self {
            n_categories,
            n_states,
            data: vec![0.0; n_categories * n_states * n_states],
        }
    }

    /// Matrices for `distance`, freshly computed from `model`.
    pub fn for_distance(model: &dyn SubstitutionModel, distance: f64) -> Self {
        let mut matrices = Self::new(model.n_categories(), model.n_states());
        matrices.compute(model, distance);
        matrices
    }

    /// Overwrite with `model`'s matrices at `distance`, reshaping if needed.
    pub fn compute(&mut self, model: &dyn SubstitutionModel, distance: f64) {
        let (nc, ns) = (model.n_categories(), model.n_states());
        if nc != self.n_categories || ns != self.n_states {
            *self = Self::new(nc, ns);
        }
        let size = ns * ns;
        for (category, block) in self.data.chunks_exact_mut(size).enumerate() {
            model.transition_probabilities(distance, category, block);
        }
    }

    #[inline]
    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    #[inline]
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Row-major matrix of one category.
    #[inline]
    pub fn category(&self, category: usize) -> &[f64] {
        let size = self.n_states * self.n_states;
        &self.data[category * size..(category + 1) * size]
    }
}

/// Last-used matrices of a stateful calculator.
///
/// States: empty, or cached at `(distance, model version)`. A request within
/// tolerance of the cached distance under the same model version reuses the
/// matrices; anything else recomputes them.
#[derive(Clone, Debug, Default)]
pub struct TransitionCache {
    matrices: TransitionMatrices,
    cached: Option<(f64, u64)>,
    recomputations: u64,
}

impl TransitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the matrices up to date. Returns true when they were recomputed.
    pub fn update(&mut self, model: &dyn SubstitutionModel, distance: f64, tolerance: f64) -> bool {
        let version = model.version();
        if let Some((cached_distance, cached_version)) = self.cached {
            if cached_version == version && (cached_distance - distance).abs() <= tolerance {
                return false;
            }
        }
        self.matrices.compute(model, distance);
        self.cached = Some((distance, version));
        self.recomputations += 1;
        true
    }

    /// Forget the cached distance so the next update recomputes.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn matrices(&self) -> &TransitionMatrices {
        &self.matrices
    }

    pub fn cached_distance(&self) -> Option<f64> {
        self.cached.map(|(d, _)| d)
    }

    /// How many times the matrices have been computed.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }
}
