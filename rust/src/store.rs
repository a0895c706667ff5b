//! Per-node conditional probability storage.
//!
//! Layout is `[category][pattern][state]`. The pattern dimension only grows.
//! A fixed store refuses to grow at all, which protects callers that have
//! sized a buffer for one use from silently getting a reallocation.

use ndarray::{s, Array3, ArrayView3, ArrayViewMut3};

use crate::error::{LikelihoodError, Result};

#[derive(Clone, Debug)]
pub struct ConditionalStore {
    data: Array3<f64>,
    n_categories: usize,
    n_states: usize,
    based_on_cached: bool,
    fixed: bool,
}

impl Default for ConditionalStore {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl ConditionalStore {
    /// Store with no pattern capacity yet.
    pub fn new(n_categories: usize, n_states: usize) -> Self {
        Self::with_capacity(n_categories, n_states, 0)
    }

    pub fn with_capacity(n_categories: usize, n_states: usize, capacity: usize) -> Self {
        Self {
            data: Array3::zeros((n_categories, capacity, n_states)),
            n_categories,
            n_states,
            based_on_cached: false,
            fixed: false,
        }
    }

    /// Store sized once for `capacity` patterns that may never grow.
    pub fn fixed(n_categories: usize, n_states: usize, capacity: usize) -> Self {
        let mut store = Self::with_capacity(n_categories, n_states, capacity);
        store.fixed = true;
        store
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.dim().1
    }

    #[inline]
    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    #[inline]
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Forbid any further growth.
    pub fn set_fixed(&mut self) {
        self.fixed = true;
    }

    /// Whether the last write was derived from previously cached inputs.
    #[inline]
    pub fn is_based_on_cached_data(&self) -> bool {
        self.based_on_cached
    }

    /// Same shape in the category and state dimensions.
    pub fn matches_shape(&self, n_categories: usize, n_states: usize) -> bool {
        self.n_categories == n_categories && self.n_states == n_states
    }

    /// Grow the pattern dimension to at least `n`. Contents are not kept
    /// across growth.
    pub fn ensure_capacity(&mut self, n: usize) -> Result<()> {
        let capacity = self.capacity();
        if n <= capacity {
            return Ok(());
        }
        if self.fixed {
            return Err(LikelihoodError::CapacityExceeded {
                requested: n,
                capacity,
            });
        }
        self.data = Array3::zeros((self.n_categories, n, self.n_states));
        Ok(())
    }

    /// Whole buffer, including capacity beyond the last written pattern count.
    pub fn get_for_read(&self) -> ArrayView3<'_, f64> {
        self.data.view()
    }

    /// First `n` patterns, failing if the store has never held that many.
    pub fn patterns_for_read(&self, n: usize) -> Result<ArrayView3<'_, f64>> {
        let capacity = self.capacity();
        if n > capacity {
            return Err(LikelihoodError::PatternCountMismatch {
                expected: n,
                actual: capacity,
            });
        }
        Ok(self.data.slice(s![.., ..n, ..]))
    }

    /// Ensure room for `n` patterns and hand out the first `n` for writing.
    pub fn get_for_write(&mut self, n: usize, based_on_cached: bool) -> Result<ArrayViewMut3<'_, f64>> {
        self.ensure_capacity(n)?;
        self.based_on_cached = based_on_cached;
        Ok(self.data.slice_mut(s![.., ..n, ..]))
    }

    /// Like [`get_for_write`](Self::get_for_write) but never reallocates.
    pub fn get_for_write_no_resize(
        &mut self,
        n: usize,
        based_on_cached: bool,
    ) -> Result<ArrayViewMut3<'_, f64>> {
        let capacity = self.capacity();
        if n > capacity {
            return Err(LikelihoodError::CapacityExceeded {
                requested: n,
                capacity,
            });
        }
        self.based_on_cached = based_on_cached;
        Ok(self.data.slice_mut(s![.., ..n, ..]))
    }
}
