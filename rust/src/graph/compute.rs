//! Lazy recomputation of half-edge caches and edge log-likelihoods.

use std::collections::HashSet;
use std::mem;

use tracing::{debug, trace};

use super::{EdgeId, HalfEdge, NodeKind, TreeGraph};
use crate::error::{LikelihoodError, Result};
use crate::model::SubstitutionModel;
use crate::pattern::PatternInfo;

impl TreeGraph {
    /// Bring the graph in line with the model's current version.
    ///
    /// A version change drops every flat and extended cache; a change in the
    /// number of rate categories also reshapes every store.
    pub(crate) fn sync_model(&mut self, model: &dyn SubstitutionModel) -> Result<()> {
        if model.n_states() != self.n_states {
            return Err(LikelihoodError::model(format!(
                "model has {} states, graph has {}",
                model.n_states(),
                self.n_states
            )));
        }
        let version = model.version();
        if self.model_version == Some(version) {
            return Ok(());
        }

        if model.n_categories() != self.n_categories {
            self.n_categories = model.n_categories();
            for idx in 0..self.caches.len() {
                let flat = self.new_store();
                let extended = self.new_store();
                let cache = &mut self.caches[idx];
                cache.flat = flat;
                cache.extended = extended;
            }
        }
        for cache in &mut self.caches {
            cache.flat_valid = false;
            cache.extended_valid = false;
        }
        debug!(
            previous = ?self.model_version,
            version,
            categories = self.n_categories,
            "model changed, conditionals invalidated"
        );
        self.model_version = Some(version);
        Ok(())
    }

    fn compute_patterns(&mut self, h: HalfEdge) -> Result<()> {
        let idx = h.index();
        let x = self.edges[h.edge.0].ends[h.side];
        match self.nodes[x.0].kind {
            NodeKind::Leaf(leaf) => {
                self.caches[idx]
                    .patterns
                    .clone_from(self.leaves[leaf].patterns().info());
            }
            NodeKind::Internal => {
                let (a, b) = self
                    .inputs(h)
                    .ok_or_else(|| LikelihoodError::invalid_topology("internal node without inputs"))?;
                let mut info = mem::take(&mut self.caches[idx].patterns);
                let built = info.build(
                    &self.caches[a.index()].patterns,
                    &self.caches[b.index()].patterns,
                );
                self.caches[idx].patterns = info;
                built?;
            }
        }
        self.caches[idx].patterns_valid = true;
        self.edge_patterns_valid[h.edge.0] = false;
        Ok(())
    }

    /// Compute the extended conditionals of a half-edge whose flat
    /// conditionals are valid.
    fn compute_extended(
        &mut self,
        model: &dyn SubstitutionModel,
        h: HalfEdge,
        based_on_cached: bool,
    ) -> Result<()> {
        let idx = h.index();
        let x = self.edges[h.edge.0].ends[h.side];
        let tolerance = self.config.distance_tolerance;
        let mut out = mem::take(&mut self.caches[idx].extended);

        let edge = &mut self.edges[h.edge.0];
        let length = edge.length;
        let matrices = edge
            .calculator
            .matrices(model, length, tolerance, &mut self.scratch[0]);
        let result = match self.nodes[x.0].kind {
            NodeKind::Leaf(leaf) => self.leaves[leaf].extend(matrices, &mut out),
            NodeKind::Internal => {
                let cache = &self.caches[idx];
                self.kernel.extend(
                    matrices,
                    cache.patterns.n_patterns(),
                    &cache.flat,
                    &mut out,
                    based_on_cached,
                )
            }
        };

        let cache = &mut self.caches[idx];
        cache.extended = out;
        result?;
        cache.extended_valid = true;
        cache.extended_computations += 1;
        trace!(edge = h.edge.0, side = h.side, length, "extended conditionals");
        Ok(())
    }

    fn compute_flat(
        &mut self,
        model: &dyn SubstitutionModel,
        h: HalfEdge,
        based_on_cached: bool,
    ) -> Result<()> {
        let idx = h.index();
        let x = self.edges[h.edge.0].ends[h.side];
        let mut out = mem::take(&mut self.caches[idx].flat);

        let result = match self.nodes[x.0].kind {
            NodeKind::Leaf(leaf) => self.leaves[leaf].fill_flat(&mut out),
            NodeKind::Internal => match self.inputs(h) {
                None => Err(LikelihoodError::invalid_topology("internal node without inputs")),
                Some((a, b)) if self.config.stateless_kernels => {
                    let left_length = self.edges[a.edge.0].length;
                    let right_length = self.edges[b.edge.0].length;
                    self.external.extend_then_flat(
                        model,
                        &self.caches[idx].patterns,
                        &self.caches[a.index()].flat,
                        left_length,
                        &self.caches[b.index()].flat,
                        right_length,
                        &mut self.scratch,
                        &mut out,
                        based_on_cached,
                    )
                }
                Some((a, b)) => {
                    let mut result = Ok(());
                    for input in [a, b] {
                        if result.is_ok() && !self.caches[input.index()].extended_valid {
                            result = self.compute_extended(model, input, true);
                        }
                    }
                    result.and_then(|_| {
                        self.kernel.flat(
                            &self.caches[idx].patterns,
                            &self.caches[a.index()].extended,
                            &self.caches[b.index()].extended,
                            &mut out,
                            based_on_cached,
                        )
                    })
                }
            },
        };

        let cache = &mut self.caches[idx];
        cache.flat = out;
        result?;
        cache.flat_valid = true;
        cache.extended_valid = false;
        cache.flat_computations += 1;
        Ok(())
    }

    /// Make the flat conditionals of `target` valid, recomputing invalid
    /// half-edges beneath it in post-order.
    pub(crate) fn ensure_flat(&mut self, model: &dyn SubstitutionModel, target: HalfEdge) -> Result<()> {
        let mut order = Vec::new();
        let mut stack = vec![(target, false)];
        while let Some((h, expanded)) = stack.pop() {
            if expanded {
                order.push(h);
                continue;
            }
            let cache = &self.caches[h.index()];
            if cache.patterns_valid && cache.flat_valid {
                continue;
            }
            stack.push((h, true));
            if let Some((a, b)) = self.inputs(h) {
                stack.push((b, false));
                stack.push((a, false));
            }
        }
        if order.is_empty() {
            return Ok(());
        }

        let mut fresh = HashSet::with_capacity(order.len());
        for &h in &order {
            if !self.caches[h.index()].patterns_valid {
                self.compute_patterns(h)?;
            }
            let based_on_cached = match self.inputs(h) {
                Some((a, b)) => !fresh.contains(&a) || !fresh.contains(&b),
                None => false,
            };
            self.compute_flat(model, h, based_on_cached)?;
            fresh.insert(h);
        }
        trace!(
            edge = target.edge.0,
            side = target.side,
            recomputed = order.len(),
            "flat conditionals refreshed"
        );
        Ok(())
    }

    pub(crate) fn ensure_extended(
        &mut self,
        model: &dyn SubstitutionModel,
        h: HalfEdge,
    ) -> Result<()> {
        let was_valid = self.caches[h.index()].flat_valid;
        self.ensure_flat(model, h)?;
        if !self.caches[h.index()].extended_valid {
            self.compute_extended(model, h, was_valid)?;
        }
        Ok(())
    }

    fn ensure_edge_patterns(&mut self, edge: EdgeId) -> Result<()> {
        if self.edge_patterns_valid[edge.0] {
            return Ok(());
        }
        let mut info = mem::take(&mut self.edge_patterns[edge.0]);
        let built = info.build(
            &self.caches[HalfEdge::new(edge, 0).index()].patterns,
            &self.caches[HalfEdge::new(edge, 1).index()].patterns,
        );
        self.edge_patterns[edge.0] = info;
        built?;
        self.edge_patterns_valid[edge.0] = true;
        Ok(())
    }

    /// Log-likelihood evaluated across `edge`.
    ///
    /// The flat conditionals on side 0 meet the side-1 conditionals extended
    /// across the edge. Every edge gives the same value up to rounding.
    pub fn log_likelihood_at(&mut self, model: &dyn SubstitutionModel, edge: EdgeId) -> Result<f64> {
        self.edge(edge)?;
        self.sync_model(model)?;
        let near = HalfEdge::new(edge, 0);
        let far = HalfEdge::new(edge, 1);
        self.ensure_flat(model, near)?;
        self.ensure_extended(model, far)?;
        self.ensure_edge_patterns(edge)?;

        self.kernel.log_likelihood(
            model,
            &self.edge_patterns[edge.0],
            &self.caches[near.index()].flat,
            &self.caches[far.index()].extended,
        )
    }

    /// Log-likelihood evaluated across edge 0.
    pub fn log_likelihood(&mut self, model: &dyn SubstitutionModel) -> Result<f64> {
        self.log_likelihood_at(model, EdgeId(0))
    }

    /// Pattern set where the two sides of `edge` meet.
    pub fn edge_patterns(&mut self, edge: EdgeId) -> Result<&PatternInfo> {
        self.edge(edge)?;
        for side in 0..2 {
            let mut stack = vec![HalfEdge::new(edge, side)];
            let mut order = Vec::new();
            while let Some(h) = stack.pop() {
                if self.caches[h.index()].patterns_valid {
                    continue;
                }
                order.push(h);
                if let Some((a, b)) = self.inputs(h) {
                    stack.push(a);
                    stack.push(b);
                }
            }
            for &h in order.iter().rev() {
                self.compute_patterns(h)?;
            }
        }
        self.ensure_edge_patterns(edge)?;
        Ok(&self.edge_patterns[edge.0])
    }
}
