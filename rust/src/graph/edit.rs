//! Branch-length and topology edits with local cache invalidation.
//!
//! Every edit validates its preconditions before touching the graph, so a
//! rejected edit leaves the graph exactly as it was.

use std::collections::BTreeSet;

use tracing::debug;

use super::{EdgeId, HalfEdge, NodeId, NodeKind, TreeGraph};
use crate::error::{LikelihoodError, Result};

/// Which neighbour pair a nearest-neighbour interchange swaps.
///
/// For an internal edge `u - v`, the first other edge at `u` is swapped with
/// the first (or second) other edge at `v`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NniVariant {
    SwapFirst,
    SwapSecond,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    /// Flat and extended conditionals.
    Conditionals,
    /// Patterns as well.
    Patterns,
}

impl TreeGraph {
    fn is_valid_at(&self, h: HalfEdge, level: Level) -> bool {
        let cache = &self.caches[h.index()];
        match level {
            Level::Conditionals => cache.flat_valid || cache.extended_valid,
            Level::Patterns => cache.patterns_valid || cache.flat_valid || cache.extended_valid,
        }
    }

    fn invalidate_half_edge(&mut self, h: HalfEdge, level: Level) {
        let cache = &mut self.caches[h.index()];
        cache.flat_valid = false;
        cache.extended_valid = false;
        if level == Level::Patterns {
            cache.patterns_valid = false;
            self.edge_patterns_valid[h.edge.0] = false;
        }
    }

    /// Invalidate everything downstream of `seeds`, stopping at half-edges
    /// that are already invalid at `level`.
    fn propagate(&mut self, seeds: Vec<HalfEdge>, level: Level) -> usize {
        let mut stack = seeds;
        let mut cleared = 0;
        while let Some(h) = stack.pop() {
            for dependent in self.dependents(h) {
                if self.is_valid_at(dependent, level) {
                    self.invalidate_half_edge(dependent, level);
                    cleared += 1;
                    stack.push(dependent);
                }
            }
        }
        cleared
    }

    /// Drop the extended caches of `edge` and everything built on them.
    pub(crate) fn invalidate_length(&mut self, edge: EdgeId) {
        let seeds = vec![HalfEdge::new(edge, 0), HalfEdge::new(edge, 1)];
        for &h in &seeds {
            self.caches[h.index()].extended_valid = false;
        }
        let cleared = self.propagate(seeds, Level::Conditionals);
        debug!(edge = edge.0, cleared, "branch length invalidation");
    }

    /// Drop every cache rooted at a touched node and everything built on them.
    pub(crate) fn invalidate_topology(&mut self, touched: &BTreeSet<NodeId>) {
        let mut seeds = Vec::new();
        for &node in touched {
            for &edge in &self.nodes[node.0].edges {
                if let Some(side) = self.edges[edge.0].side_of(node) {
                    seeds.push(HalfEdge::new(edge, side));
                }
            }
        }
        for &h in &seeds {
            self.invalidate_half_edge(h, Level::Patterns);
        }
        let n_seeds = seeds.len();
        let cleared = self.propagate(seeds, Level::Patterns);
        debug!(
            touched = touched.len(),
            seeds = n_seeds,
            cleared,
            "topology invalidation"
        );
    }

    /// Set one branch length. Returns false when the change is within the
    /// distance tolerance and nothing was invalidated.
    pub fn set_branch_length(&mut self, edge: EdgeId, length: f64) -> Result<bool> {
        let current = self.edge(edge)?.length;
        if !(length >= 0.0) || !length.is_finite() {
            return Err(LikelihoodError::invalid_data(format!(
                "branch length must be finite and non-negative, got {}",
                length
            )));
        }
        if (length - current).abs() <= self.config.distance_tolerance {
            return Ok(false);
        }
        self.edges[edge.0].length = length;
        self.invalidate_length(edge);
        Ok(true)
    }

    /// Set every branch length, in edge order.
    pub fn set_branch_lengths(&mut self, lengths: &[f64]) -> Result<()> {
        if lengths.len() != self.edges.len() {
            return Err(LikelihoodError::invalid_data(format!(
                "expected {} branch lengths, got {}",
                self.edges.len(),
                lengths.len()
            )));
        }
        if let Some(bad) = lengths.iter().find(|l| !(**l >= 0.0) || !l.is_finite()) {
            return Err(LikelihoodError::invalid_data(format!(
                "branch length must be finite and non-negative, got {}",
                bad
            )));
        }
        for (idx, &length) in lengths.iter().enumerate() {
            self.set_branch_length(EdgeId(idx), length)?;
        }
        Ok(())
    }

    fn replace_neighbour(&mut self, node: NodeId, old: EdgeId, new: EdgeId) {
        for slot in &mut self.nodes[node.0].edges {
            if *slot == old {
                *slot = new;
            }
        }
    }

    /// Repoint the end of `edge` that currently sits at `from` to `to`.
    fn move_end(&mut self, edge: EdgeId, from: NodeId, to: NodeId) {
        if let Some(side) = self.edges[edge.0].side_of(from) {
            self.edges[edge.0].ends[side] = to;
        }
    }

    fn other_edges(&self, node: NodeId, except: EdgeId) -> Vec<EdgeId> {
        self.nodes[node.0]
            .edges
            .iter()
            .copied()
            .filter(|&e| e != except)
            .collect()
    }

    fn finish_topology_edit(&mut self, touched: BTreeSet<NodeId>) -> Result<()> {
        self.check_nodes(&touched)?;
        self.invalidate_topology(&touched);
        Ok(())
    }

    /// Nearest-neighbour interchange across an internal edge.
    pub fn nni(&mut self, edge: EdgeId, variant: NniVariant) -> Result<()> {
        let [u, v] = self.edge(edge)?.ends;
        if self.nodes[u.0].kind != NodeKind::Internal || self.nodes[v.0].kind != NodeKind::Internal {
            return Err(LikelihoodError::invalid_topology(format!(
                "edge {} is not internal",
                edge.0
            )));
        }
        let u_others = self.other_edges(u, edge);
        let v_others = self.other_edges(v, edge);
        if u_others.len() != 2 || v_others.len() != 2 {
            return Err(LikelihoodError::invalid_topology("internal node without three edges"));
        }
        let a = u_others[0];
        let b = match variant {
            NniVariant::SwapFirst => v_others[0],
            NniVariant::SwapSecond => v_others[1],
        };

        self.move_end(a, u, v);
        self.move_end(b, v, u);
        self.replace_neighbour(u, a, b);
        self.replace_neighbour(v, b, a);

        debug!(edge = edge.0, moved = ?(a.0, b.0), "nni");
        self.finish_topology_edit([u, v].into_iter().collect())
    }

    /// Edges inside the subtree at `ends[side]` of `edge`, looking away from it.
    fn subtree_edges(&self, edge: EdgeId, side: usize) -> BTreeSet<EdgeId> {
        let mut found = BTreeSet::new();
        let mut stack = vec![(self.edges[edge.0].ends[side], edge)];
        while let Some((node, via)) = stack.pop() {
            for &next in &self.nodes[node.0].edges {
                if next != via && found.insert(next) {
                    stack.push((self.far_end(next, node), next));
                }
            }
        }
        found
    }

    /// Subtree prune and regraft.
    ///
    /// The subtree at `ends[side]` of `prune` is detached together with the
    /// node at the other end, whose two remaining edges are merged into one.
    /// That node is then inserted into `regraft`, splitting its length evenly.
    pub fn spr(&mut self, prune: EdgeId, side: usize, regraft: EdgeId) -> Result<()> {
        if side > 1 {
            return Err(LikelihoodError::invalid_data(format!("edge side {} out of range", side)));
        }
        let p_ends = self.edge(prune)?.ends;
        self.edge(regraft)?;
        let u = p_ends[1 - side];
        if self.nodes[u.0].kind != NodeKind::Internal {
            return Err(LikelihoodError::invalid_topology("prune point is a leaf"));
        }
        let others = self.other_edges(u, prune);
        if others.len() != 2 {
            return Err(LikelihoodError::invalid_topology("internal node without three edges"));
        }
        let (a, b) = (others[0], others[1]);
        if regraft == prune || regraft == a || regraft == b {
            return Err(LikelihoodError::invalid_topology(format!(
                "regraft edge {} is adjacent to the prune point",
                regraft.0
            )));
        }
        if self.subtree_edges(prune, side).contains(&regraft) {
            return Err(LikelihoodError::invalid_topology(format!(
                "regraft edge {} lies inside the pruned subtree",
                regraft.0
            )));
        }

        let x = self.far_end(a, u);
        let y = self.far_end(b, u);
        let [v, w] = self.edges[regraft.0].ends;

        // Close the gap: a now spans x - y, b is free.
        let merged = self.edges[a.0].length + self.edges[b.0].length;
        self.move_end(a, u, y);
        self.replace_neighbour(y, b, a);
        self.edges[a.0].length = merged;

        // Split the regraft edge: regraft spans v - u, b spans u - w.
        let split = self.edges[regraft.0].length;
        let half = split * 0.5;
        self.move_end(regraft, w, u);
        self.replace_neighbour(w, regraft, b);
        self.edges[b.0].ends = [u, w];
        self.edges[regraft.0].length = half;
        self.edges[b.0].length = split - half;
        self.replace_neighbour(u, a, regraft);

        debug!(prune = prune.0, side, regraft = regraft.0, "spr");
        self.finish_topology_edit([u, x, y, v, w].into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{four_taxon, six_taxon};
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::JukesCantor;

    fn graph_from(tree_alignment: (crate::tree::Tree, crate::alignment::Alignment)) -> TreeGraph {
        let (tree, alignment) = tree_alignment;
        let model = JukesCantor::nucleotide();
        TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap()
    }

    fn cold(graph: &TreeGraph, model: &JukesCantor) -> f64 {
        let mut copy = graph.clone();
        copy.invalidate_all();
        copy.log_likelihood(model).unwrap()
    }

    fn snapshot(graph: &TreeGraph) -> Vec<([NodeId; 2], u64)> {
        graph
            .edge_ids()
            .map(|e| (graph.edge_ends(e).unwrap(), graph.edge_length(e).unwrap().to_bits()))
            .collect()
    }

    #[test]
    fn test_length_edit_is_local() {
        let mut graph = graph_from(six_taxon());
        let model = JukesCantor::nucleotide();
        // Warm every direction.
        for e in graph.edge_ids().collect::<Vec<_>>() {
            graph.log_likelihood_at(&model, e).unwrap();
        }
        let leaf = graph.leaf_node("A").unwrap();
        let edge = graph.node_edges(leaf).unwrap()[0];
        let leaf_side = graph.edges[edge.0].side_of(leaf).unwrap();

        assert!(graph.set_branch_length(edge, 0.33).unwrap());

        // The leaf's own flat cache does not depend on its branch.
        let status = graph.half_edge_status(edge, leaf_side).unwrap();
        assert!(status.flat_valid);
        assert!(!status.extended_valid);
        // The other direction of the same edge looks away from the edit.
        assert!(graph.half_edge_status(edge, 1 - leaf_side).unwrap().flat_valid);

        for e in graph.edge_ids() {
            for side in 0..2 {
                let h = HalfEdge::new(e, side);
                let contains = graph.subtree_edges(e, side).contains(&edge);
                let status = graph.half_edge_status(e, side).unwrap();
                assert!(status.patterns_valid);
                if h.edge != edge {
                    assert_eq!(status.flat_valid, !contains, "edge {} side {}", e.0, side);
                }
            }
        }

        let warm = graph.log_likelihood(&model).unwrap();
        assert!((warm - cold(&graph, &model)).abs() < 1e-12);
    }

    #[test]
    fn test_length_edit_reuses_unrelated_buffers() {
        let mut graph = graph_from(six_taxon());
        let model = JukesCantor::nucleotide();
        let edges: Vec<EdgeId> = graph.edge_ids().collect();
        for &e in &edges {
            graph.log_likelihood_at(&model, e).unwrap();
        }
        let before: Vec<(u64, Vec<u64>)> = edges
            .iter()
            .flat_map(|&e| [(e, 0), (e, 1)])
            .map(|(e, side)| {
                let status = graph.half_edge_status(e, side).unwrap();
                let values = graph.conditionals(e, side).unwrap().unwrap();
                (status.flat_computations, values.iter().map(|v| v.to_bits()).collect())
            })
            .collect();

        let edited = graph.internal_edges()[0];
        assert!(graph.set_branch_length(edited, 0.77).unwrap());
        for &e in &edges {
            graph.log_likelihood_at(&model, e).unwrap();
        }

        let (mut untouched, mut recomputed) = (0, 0);
        for (i, (e, side)) in edges.iter().flat_map(|&e| [(e, 0), (e, 1)]).enumerate() {
            let status = graph.half_edge_status(e, side).unwrap();
            let (count, values) = &before[i];
            if graph.subtree_edges(e, side).contains(&edited) {
                assert!(status.flat_computations > *count, "edge {} side {}", e.0, side);
                recomputed += 1;
            } else {
                assert_eq!(status.flat_computations, *count, "edge {} side {}", e.0, side);
                let now: Vec<u64> = graph
                    .conditionals(e, side)
                    .unwrap()
                    .unwrap()
                    .iter()
                    .map(|v| v.to_bits())
                    .collect();
                assert_eq!(&now, values, "edge {} side {}", e.0, side);
                untouched += 1;
            }
        }
        assert!(untouched > 0 && recomputed > 0);
        let warm = graph.log_likelihood(&model).unwrap();
        assert!((warm - cold(&graph, &model)).abs() < 1e-12);
    }

    #[test]
    fn test_tiny_length_change_ignored() {
        let mut graph = graph_from(four_taxon());
        let edge = EdgeId(0);
        let length = graph.edge_length(edge).unwrap();
        assert!(!graph.set_branch_length(edge, length + 1e-14).unwrap());
        assert_eq!(graph.edge_length(edge).unwrap(), length);
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut graph = graph_from(four_taxon());
        assert!(graph.set_branch_length(EdgeId(0), -1.0).is_err());
        assert!(graph.set_branch_length(EdgeId(0), f64::NAN).is_err());
        assert!(matches!(
            graph.set_branch_length(EdgeId(99), 1.0),
            Err(LikelihoodError::UnknownEdge(99))
        ));
    }

    #[test]
    fn test_nni_keeps_tree_valid_and_matches_cold() {
        let mut graph = graph_from(six_taxon());
        let model = JukesCantor::nucleotide();
        let before = graph.log_likelihood(&model).unwrap();
        let edge = graph.internal_edges()[0];
        graph.nni(edge, NniVariant::SwapSecond).unwrap();
        graph.validate().unwrap();
        let after = graph.log_likelihood(&model).unwrap();
        assert!((after - cold(&graph, &model)).abs() < 1e-12);
        assert_ne!(before, after);
    }

    #[test]
    fn test_nni_on_leaf_edge_rejected() {
        let mut graph = graph_from(four_taxon());
        let leaf = graph.leaf_node("A").unwrap();
        let edge = graph.node_edges(leaf).unwrap()[0];
        let before = snapshot(&graph);
        assert!(graph.nni(edge, NniVariant::SwapFirst).is_err());
        assert_eq!(before, snapshot(&graph));
    }

    #[test]
    fn test_spr_matches_cold_and_preserves_length() {
        let mut graph = graph_from(six_taxon());
        let model = JukesCantor::nucleotide();
        graph.log_likelihood(&model).unwrap();
        let total: f64 = graph.branch_lengths().iter().sum();

        let a = graph.leaf_node("A").unwrap();
        let prune = graph.node_edges(a).unwrap()[0];
        let side = graph.edges[prune.0].side_of(a).unwrap();
        let f = graph.leaf_node("F").unwrap();
        let regraft = graph.node_edges(f).unwrap()[0];

        graph.spr(prune, side, regraft).unwrap();
        graph.validate().unwrap();
        let after_total: f64 = graph.branch_lengths().iter().sum();
        assert!((total - after_total).abs() < 1e-12);

        let warm = graph.log_likelihood(&model).unwrap();
        assert!((warm - cold(&graph, &model)).abs() < 1e-12);
    }

    #[test]
    fn test_spr_into_own_subtree_rejected() {
        let mut graph = graph_from(six_taxon());
        let edge = graph.internal_edges()[0];
        let inside = graph.subtree_edges(edge, 0);
        // Pick an edge inside side 0 that is not adjacent to the prune point.
        let u = graph.edges[edge.0].ends[1];
        let candidate = inside
            .iter()
            .copied()
            .find(|e| !graph.nodes[u.0].edges.contains(e));
        if let Some(regraft) = candidate {
            let before = snapshot(&graph);
            assert!(graph.spr(edge, 0, regraft).is_err());
            assert_eq!(before, snapshot(&graph));
        }
    }

    #[test]
    fn test_mark_undo_is_bit_identical() {
        let mut graph = graph_from(six_taxon());
        let model = JukesCantor::nucleotide();
        let before_ll = graph.log_likelihood(&model).unwrap();
        let before = snapshot(&graph);

        graph.mark();
        let edge = graph.internal_edges()[0];
        graph.nni(edge, NniVariant::SwapFirst).unwrap();
        graph.set_branch_length(EdgeId(0), 0.9).unwrap();
        graph.log_likelihood(&model).unwrap();
        graph.undo().unwrap();

        assert_eq!(before, snapshot(&graph));
        let after_ll = graph.log_likelihood(&model).unwrap();
        assert_eq!(before_ll.to_bits(), after_ll.to_bits());
    }

    #[test]
    fn test_mark_undo_after_spr() {
        let mut graph = graph_from(six_taxon());
        let model = JukesCantor::nucleotide();
        let before_ll = graph.log_likelihood(&model).unwrap();
        let before = snapshot(&graph);

        graph.mark();
        let b = graph.leaf_node("B").unwrap();
        let prune = graph.node_edges(b).unwrap()[0];
        let side = graph.edges[prune.0].side_of(b).unwrap();
        let e = graph.leaf_node("E").unwrap();
        let regraft = graph.node_edges(e).unwrap()[0];
        graph.spr(prune, side, regraft).unwrap();
        graph.log_likelihood(&model).unwrap();
        graph.undo().unwrap();
        graph.validate().unwrap();

        assert_eq!(before, snapshot(&graph));
        assert_eq!(before_ll.to_bits(), graph.log_likelihood(&model).unwrap().to_bits());
    }
}
