//! Leaf conditionals.
//!
//! A leaf's flat conditional for a known state is one-hot; for an unknown
//! state it is all ones. Extension therefore reduces to picking a column of
//! the transition matrix (or summing a row), one vector per leaf pattern.

use super::transition::TransitionMatrices;
use crate::error::{LikelihoodError, Result};
use crate::pattern::LeafPatterns;
use crate::store::ConditionalStore;

#[derive(Clone, Debug)]
pub struct LeafCalculator {
    patterns: LeafPatterns,
}

impl LeafCalculator {
    pub fn new(patterns: LeafPatterns) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &LeafPatterns {
        &self.patterns
    }

    fn check_shape(&self, store: &ConditionalStore) -> Result<()> {
        if store.n_states() != self.patterns.n_states() {
            return Err(LikelihoodError::model(format!(
                "leaf has {} states, store has {}",
                self.patterns.n_states(),
                store.n_states()
            )));
        }
        Ok(())
    }

    /// Write the flat (unextended) leaf conditionals.
    pub fn fill_flat(&self, out: &mut ConditionalStore) -> Result<()> {
        self.check_shape(out)?;
        let n = self.patterns.n_patterns();
        let mut view = out.get_for_write(n, false)?;
        for mut store_c in view.outer_iter_mut() {
            for (pattern, mut row) in store_c.outer_iter_mut().enumerate() {
                match self.patterns.pattern_state(pattern) {
                    Some(state) => {
                        row.fill(0.0);
                        row[state] = 1.0;
                    }
                    None => row.fill(1.0),
                }
            }
        }
        Ok(())
    }

    /// Write leaf conditionals extended across a branch with `matrices`.
    pub fn extend(&self, matrices: &TransitionMatrices, out: &mut ConditionalStore) -> Result<()> {
        self.check_shape(out)?;
        if matrices.n_categories() != out.n_categories() {
            return Err(LikelihoodError::model(format!(
                "{} transition matrices for a {}-category store",
                matrices.n_categories(),
                out.n_categories()
            )));
        }
        let n = self.patterns.n_patterns();
        let n_states = self.patterns.n_states();
        let mut view = out.get_for_write(n, false)?;
        for (c, mut store_c) in view.outer_iter_mut().enumerate() {
            let p = matrices.category(c);
            for (pattern, mut row) in store_c.outer_iter_mut().enumerate() {
                match self.patterns.pattern_state(pattern) {
                    Some(state) => {
                        for (i, cell) in row.iter_mut().enumerate() {
                            *cell = p[i * n_states + state];
                        }
                    }
                    None => {
                        for (i, cell) in row.iter_mut().enumerate() {
                            *cell = p[i * n_states..(i + 1) * n_states]
                                .iter()
                                .fold(0.0, |acc, &x| acc + x);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
