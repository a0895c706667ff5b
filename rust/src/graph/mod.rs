//! Unrooted tree graph with directional likelihood caches.
//!
//! Nodes and edges live in arenas addressed by [`NodeId`] and [`EdgeId`].
//! Every edge has two half-edges: `(edge, side)` stands for the subtree at
//! `ends[side]` looking away from the edge. Each half-edge caches
//! - the pattern set of that subtree,
//! - its flat conditionals at `ends[side]`,
//! - those conditionals extended across the edge.
//!
//! A cache is recomputed only when asked for after being invalidated, and an
//! edit invalidates only the half-edges whose subtree structurally contains
//! the edited element.

mod compute;
mod edit;

pub use edit::NniVariant;

use std::collections::BTreeSet;

use ndarray::ArrayView3;
use tracing::debug;

use crate::alignment::Alignment;
use crate::config::EngineConfig;
use crate::error::{LikelihoodError, Result};
use crate::kernel::{
    BranchCalculator, CalculatorFactory, ExternalCalculator, Kernel, LeafCalculator,
    TransitionMatrices,
};
use crate::model::SubstitutionModel;
use crate::pattern::PatternInfo;
use crate::store::ConditionalStore;
use crate::tree::Tree;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// Subtree at `ends[side]` of `edge`, looking away from the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct HalfEdge {
    pub(crate) edge: EdgeId,
    pub(crate) side: usize,
}

impl HalfEdge {
    #[inline]
    pub(crate) fn new(edge: EdgeId, side: usize) -> Self {
        Self { edge, side }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.edge.0 * 2 + self.side
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    /// Index into the graph's leaf calculators.
    Leaf(usize),
    Internal,
}

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) edges: Vec<EdgeId>,
    marked: Option<Vec<EdgeId>>,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            edges: Vec::with_capacity(3),
            marked: None,
        }
    }

    fn mark(&mut self) {
        self.marked = Some(self.edges.clone());
    }

    /// Restore the marked neighbour list. Returns true if it differed.
    fn undo(&mut self) -> bool {
        match &self.marked {
            Some(marked) if *marked != self.edges => {
                self.edges.clone_from(marked);
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Edge {
    pub(crate) ends: [NodeId; 2],
    pub(crate) length: f64,
    pub(crate) calculator: BranchCalculator,
    marked: Option<([NodeId; 2], f64)>,
}

/// What an edge restore changed.
struct EdgeRestore {
    previous_ends: Option<[NodeId; 2]>,
    length_changed: bool,
}

impl Edge {
    fn mark(&mut self) {
        self.marked = Some((self.ends, self.length));
    }

    fn undo(&mut self) -> EdgeRestore {
        let mut restore = EdgeRestore {
            previous_ends: None,
            length_changed: false,
        };
        if let Some((ends, length)) = self.marked {
            if ends != self.ends {
                restore.previous_ends = Some(self.ends);
                self.ends = ends;
            }
            if length.to_bits() != self.length.to_bits() {
                self.length = length;
                restore.length_changed = true;
            }
        }
        restore
    }

    #[inline]
    pub(crate) fn side_of(&self, node: NodeId) -> Option<usize> {
        if self.ends[0] == node {
            Some(0)
        } else if self.ends[1] == node {
            Some(1)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct HalfEdgeCache {
    pub(crate) patterns: PatternInfo,
    pub(crate) flat: ConditionalStore,
    pub(crate) extended: ConditionalStore,
    pub(crate) patterns_valid: bool,
    pub(crate) flat_valid: bool,
    pub(crate) extended_valid: bool,
    pub(crate) flat_computations: u64,
    pub(crate) extended_computations: u64,
}

impl HalfEdgeCache {
    fn new(n_sites: usize, flat: ConditionalStore, extended: ConditionalStore) -> Self {
        Self {
            patterns: PatternInfo::with_sites(n_sites),
            flat,
            extended,
            patterns_valid: false,
            flat_valid: false,
            extended_valid: false,
            flat_computations: 0,
            extended_computations: 0,
        }
    }
}

/// Validity and recomputation counters of one half-edge cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalfEdgeStatus {
    pub patterns_valid: bool,
    pub flat_valid: bool,
    pub extended_valid: bool,
    pub flat_computations: u64,
    pub extended_computations: u64,
}

/// Mutable unrooted binary tree bound to an alignment.
#[derive(Clone, Debug)]
pub struct TreeGraph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) caches: Vec<HalfEdgeCache>,
    /// Pattern set where the two sides of each edge meet.
    pub(crate) edge_patterns: Vec<PatternInfo>,
    pub(crate) edge_patterns_valid: Vec<bool>,
    pub(crate) leaves: Vec<LeafCalculator>,
    leaf_labels: Vec<String>,
    pub(crate) n_sites: usize,
    pub(crate) n_states: usize,
    pub(crate) n_categories: usize,
    pub(crate) kernel: Kernel,
    pub(crate) external: ExternalCalculator,
    pub(crate) scratch: [TransitionMatrices; 2],
    pub(crate) config: EngineConfig,
    pub(crate) model_version: Option<u64>,
    has_mark: bool,
}

impl TreeGraph {
    /// Build the graph from a rooted input tree.
    ///
    /// A root with two children is suppressed: its two branches become one
    /// edge. Every tip label must name a sequence in the alignment.
    pub fn from_tree(
        tree: &Tree,
        alignment: &Alignment,
        model: &dyn SubstitutionModel,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if model.n_states() != alignment.n_states() {
            return Err(LikelihoodError::model(format!(
                "model has {} states, alignment has {}",
                model.n_states(),
                alignment.n_states()
            )));
        }
        let kernel = config.resolve_kernel(model.n_states())?;
        let factory = CalculatorFactory::new(kernel, config.stateless_kernels);

        let n_sites = alignment.n_sites();
        let n_states = alignment.n_states();

        let mut nodes = Vec::new();
        let mut leaves = Vec::new();
        let mut leaf_labels = Vec::new();
        let mut graph_node = vec![None; tree.n_nodes];

        let suppress_root = tree.children[tree.root_index].len() == 2;

        for node in 0..tree.n_nodes {
            if tree.is_tip(node) {
                let label = tree.tip_label(node);
                let sequence = alignment.sequence_by_label(label).ok_or_else(|| {
                    LikelihoodError::invalid_data(format!("no sequence for tip '{}'", label))
                })?;
                graph_node[node] = Some(NodeId(nodes.len()));
                nodes.push(Node::new(NodeKind::Leaf(leaves.len())));
                leaves.push(factory.leaf_calculator(sequence, n_states)?);
                leaf_labels.push(label.to_string());
            } else if !(suppress_root && node == tree.root_index) {
                graph_node[node] = Some(NodeId(nodes.len()));
                nodes.push(Node::new(NodeKind::Internal));
            }
        }

        let mut edges: Vec<Edge> = Vec::new();
        let mut connect = |nodes: &mut Vec<Node>, a: NodeId, b: NodeId, length: f64| {
            let id = EdgeId(edges.len());
            edges.push(Edge {
                ends: [a, b],
                length,
                calculator: factory.branch_calculator(),
                marked: None,
            });
            nodes[a.0].edges.push(id);
            nodes[b.0].edges.push(id);
        };

        for node in 0..tree.n_nodes {
            let Some(parent) = tree.parent(node) else {
                continue;
            };
            let Some(child_id) = graph_node[node] else {
                continue;
            };
            if suppress_root && parent == tree.root_index {
                continue;
            }
            let parent_id = graph_node[parent]
                .ok_or_else(|| LikelihoodError::invalid_topology("parent missing from graph"))?;
            connect(&mut nodes, child_id, parent_id, tree.branch_lengths[node]);
        }

        if suppress_root {
            let kids = &tree.children[tree.root_index];
            let (a, b) = (kids[0], kids[1]);
            let (Some(a_id), Some(b_id)) = (graph_node[a], graph_node[b]) else {
                return Err(LikelihoodError::invalid_topology("root children missing from graph"));
            };
            connect(
                &mut nodes,
                a_id,
                b_id,
                tree.branch_lengths[a] + tree.branch_lengths[b],
            );
        }

        let n_categories = model.n_categories();
        let mut graph = Self {
            caches: Vec::new(),
            edge_patterns: vec![PatternInfo::with_sites(n_sites); edges.len()],
            edge_patterns_valid: vec![false; edges.len()],
            nodes,
            edges,
            leaves,
            leaf_labels,
            n_sites,
            n_states,
            n_categories,
            kernel,
            external: factory.external(),
            scratch: [TransitionMatrices::default(), TransitionMatrices::default()],
            config: config.clone(),
            model_version: None,
            has_mark: false,
        };
        graph.caches = (0..graph.edges.len() * 2)
            .map(|_| HalfEdgeCache::new(n_sites, graph.new_store(), graph.new_store()))
            .collect();
        graph.validate()?;

        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            leaves = graph.leaves.len(),
            sites = n_sites,
            kernel = ?kernel,
            "built tree graph"
        );
        Ok(graph)
    }

    pub(crate) fn new_store(&self) -> ConditionalStore {
        if self.config.fixed_stores {
            ConditionalStore::fixed(self.n_categories, self.n_states, self.n_sites)
        } else {
            ConditionalStore::new(self.n_categories, self.n_states)
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.leaves.len()
    }

    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> {
        (0..self.edges.len()).map(EdgeId)
    }

    pub(crate) fn edge(&self, edge: EdgeId) -> Result<&Edge> {
        self.edges
            .get(edge.0)
            .ok_or(LikelihoodError::UnknownEdge(edge.0))
    }

    pub(crate) fn node(&self, node: NodeId) -> Result<&Node> {
        self.nodes
            .get(node.0)
            .ok_or(LikelihoodError::UnknownNode(node.0))
    }

    pub fn edge_length(&self, edge: EdgeId) -> Result<f64> {
        Ok(self.edge(edge)?.length)
    }

    pub fn edge_ends(&self, edge: EdgeId) -> Result<[NodeId; 2]> {
        Ok(self.edge(edge)?.ends)
    }

    pub fn node_edges(&self, node: NodeId) -> Result<&[EdgeId]> {
        Ok(&self.node(node)?.edges)
    }

    pub fn is_leaf(&self, node: NodeId) -> Result<bool> {
        Ok(matches!(self.node(node)?.kind, NodeKind::Leaf(_)))
    }

    /// Label of a leaf node, `None` for internal nodes.
    pub fn leaf_label(&self, node: NodeId) -> Result<Option<&str>> {
        Ok(match self.node(node)?.kind {
            NodeKind::Leaf(leaf) => Some(self.leaf_labels[leaf].as_str()),
            NodeKind::Internal => None,
        })
    }

    /// Leaf node carrying `label`.
    pub fn leaf_node(&self, label: &str) -> Option<NodeId> {
        let leaf = self.leaf_labels.iter().position(|l| l == label)?;
        self.nodes
            .iter()
            .position(|n| n.kind == NodeKind::Leaf(leaf))
            .map(NodeId)
    }

    /// Edges with internal nodes at both ends.
    pub fn internal_edges(&self) -> Vec<EdgeId> {
        self.edge_ids()
            .filter(|e| {
                self.edges[e.0]
                    .ends
                    .iter()
                    .all(|n| self.nodes[n.0].kind == NodeKind::Internal)
            })
            .collect()
    }

    pub fn branch_lengths(&self) -> Vec<f64> {
        self.edges.iter().map(|e| e.length).collect()
    }

    /// Other end of `edge` as seen from `node`.
    pub(crate) fn far_end(&self, edge: EdgeId, node: NodeId) -> NodeId {
        let ends = self.edges[edge.0].ends;
        if ends[0] == node {
            ends[1]
        } else {
            ends[0]
        }
    }

    /// Half-edges whose subtrees feed the given half-edge's flat conditionals.
    pub(crate) fn inputs(&self, h: HalfEdge) -> Option<(HalfEdge, HalfEdge)> {
        let x = self.edges[h.edge.0].ends[h.side];
        let node = &self.nodes[x.0];
        if node.kind != NodeKind::Internal {
            return None;
        }
        let mut others = node.edges.iter().filter(|&&g| g != h.edge).map(|&g| {
            let y = self.far_end(g, x);
            let side = self.edges[g.0].side_of(y).unwrap_or(0);
            HalfEdge::new(g, side)
        });
        match (others.next(), others.next()) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }

    /// Half-edges that take `h` as an input.
    pub(crate) fn dependents(&self, h: HalfEdge) -> Vec<HalfEdge> {
        let y = self.edges[h.edge.0].ends[1 - h.side];
        let node = &self.nodes[y.0];
        if node.kind != NodeKind::Internal {
            return Vec::new();
        }
        node.edges
            .iter()
            .filter(|&&g| g != h.edge)
            .filter_map(|&g| self.edges[g.0].side_of(y).map(|side| HalfEdge::new(g, side)))
            .collect()
    }

    /// Check the whole-tree invariant: leaves have one edge, internal nodes
    /// three, edge ends agree with node lists, and the graph is a tree.
    pub fn validate(&self) -> Result<()> {
        let all: BTreeSet<NodeId> = (0..self.nodes.len()).map(NodeId).collect();
        self.check_nodes(&all)?;
        if self.edges.len() + 1 != self.nodes.len() {
            return Err(LikelihoodError::invalid_topology(format!(
                "{} edges for {} nodes",
                self.edges.len(),
                self.nodes.len()
            )));
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![NodeId(0)];
        seen[0] = true;
        while let Some(node) = stack.pop() {
            for &edge in &self.nodes[node.0].edges {
                let next = self.far_end(edge, node);
                if !seen[next.0] {
                    seen[next.0] = true;
                    stack.push(next);
                }
            }
        }
        if seen.iter().any(|&s| !s) {
            return Err(LikelihoodError::invalid_topology("graph is not connected"));
        }
        Ok(())
    }

    /// Local invariant check for a set of nodes.
    pub(crate) fn check_nodes(&self, nodes: &BTreeSet<NodeId>) -> Result<()> {
        for &id in nodes {
            let node = self.node(id)?;
            let expected = match node.kind {
                NodeKind::Leaf(_) => 1,
                NodeKind::Internal => 3,
            };
            if node.edges.len() != expected {
                return Err(LikelihoodError::invalid_topology(format!(
                    "node {} has {} edges, expected {}",
                    id.0,
                    node.edges.len(),
                    expected
                )));
            }
            for &edge in &node.edges {
                let e = self.edge(edge)?;
                if e.side_of(id).is_none() || e.ends[0] == e.ends[1] {
                    return Err(LikelihoodError::invalid_topology(format!(
                        "edge {} does not connect node {}",
                        edge.0, id.0
                    )));
                }
            }
        }
        Ok(())
    }

    /// Snapshot every node's neighbours and every edge's ends and length.
    pub fn mark(&mut self) {
        for node in &mut self.nodes {
            node.mark();
        }
        for edge in &mut self.edges {
            edge.mark();
        }
        self.has_mark = true;
    }

    pub fn has_mark(&self) -> bool {
        self.has_mark
    }

    /// Restore the state saved by [`mark`](Self::mark) and invalidate exactly
    /// the caches that depend on what changed. The mark stays in place.
    pub fn undo(&mut self) -> Result<()> {
        if !self.has_mark {
            return Err(LikelihoodError::invalid_topology("undo without a mark"));
        }

        let mut touched = BTreeSet::new();
        let mut resized = Vec::new();
        for (idx, edge) in self.edges.iter_mut().enumerate() {
            let restore = edge.undo();
            if let Some(previous) = restore.previous_ends {
                touched.extend(previous);
                touched.extend(edge.ends);
            }
            if restore.length_changed {
                resized.push(EdgeId(idx));
            }
        }
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if node.undo() {
                touched.insert(NodeId(idx));
            }
        }

        self.check_nodes(&touched)?;
        if !touched.is_empty() {
            self.invalidate_topology(&touched);
        }
        for edge in &resized {
            self.invalidate_length(*edge);
        }
        debug!(
            touched = touched.len(),
            resized = resized.len(),
            "restored marked tree state"
        );
        Ok(())
    }

    /// Cache state of the half-edge at `ends[side]` of `edge`.
    pub fn half_edge_status(&self, edge: EdgeId, side: usize) -> Result<HalfEdgeStatus> {
        self.edge(edge)?;
        if side > 1 {
            return Err(LikelihoodError::invalid_data(format!("edge side {} out of range", side)));
        }
        let cache = &self.caches[HalfEdge::new(edge, side).index()];
        Ok(HalfEdgeStatus {
            patterns_valid: cache.patterns_valid,
            flat_valid: cache.flat_valid,
            extended_valid: cache.extended_valid,
            flat_computations: cache.flat_computations,
            extended_computations: cache.extended_computations,
        })
    }

    /// Cached flat conditionals of a half-edge, if currently valid.
    pub fn conditionals(&self, edge: EdgeId, side: usize) -> Result<Option<ArrayView3<'_, f64>>> {
        let status = self.half_edge_status(edge, side)?;
        if !status.flat_valid {
            return Ok(None);
        }
        let cache = &self.caches[HalfEdge::new(edge, side).index()];
        Ok(Some(cache.flat.patterns_for_read(cache.patterns.n_patterns())?))
    }

    /// Provenance flag of a half-edge's flat conditionals.
    pub fn is_based_on_cached_data(&self, edge: EdgeId, side: usize) -> Result<bool> {
        self.half_edge_status(edge, side)?;
        Ok(self.caches[HalfEdge::new(edge, side).index()]
            .flat
            .is_based_on_cached_data())
    }

    /// Drop every cache, forcing a cold recomputation.
    pub fn invalidate_all(&mut self) {
        for cache in &mut self.caches {
            cache.patterns_valid = false;
            cache.flat_valid = false;
            cache.extended_valid = false;
        }
        for valid in &mut self.edge_patterns_valid {
            *valid = false;
        }
        for edge in &mut self.edges {
            edge.calculator.invalidate();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::JukesCantor;

    /// ((A,B),(C,D)) with all branches 0.1.
    pub(crate) fn four_taxon() -> (Tree, Alignment) {
        let tree = Tree::from_structure_with_labels(
            vec![4, 4, 5, 5, 6, 6, -1],
            vec![0.1; 7],
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
        )
        .unwrap();
        let alignment = Alignment::from_nucleotides(&[
            ("A", "AACGT"),
            ("B", "AACGA"),
            ("C", "GGCGT"),
            ("D", "GGCGA"),
        ])
        .unwrap();
        (tree, alignment)
    }

    /// Six taxa: (((A,B),C),(D,(E,F))).
    pub(crate) fn six_taxon() -> (Tree, Alignment) {
        let tree = Tree::from_structure_with_labels(
            vec![6, 6, 7, 9, 8, 8, 7, 10, 9, 10, -1],
            vec![0.1, 0.2, 0.15, 0.05, 0.3, 0.1, 0.12, 0.07, 0.2, 0.09, 0.0],
            ["A", "B", "C", "D", "E", "F"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        let alignment = Alignment::from_nucleotides(&[
            ("A", "ACGTACGTAAGGCTTA"),
            ("B", "ACGTACGAAAGGCTTA"),
            ("C", "ACGTTCGAAAGCCTTA"),
            ("D", "TCGTTCGAAAGCATTG"),
            ("E", "TCGATCGAACGCATTG"),
            ("F", "TCGATCGTACGCAT-G"),
        ])
        .unwrap();
        (tree, alignment)
    }

    #[test]
    fn test_root_suppressed() {
        let (tree, alignment) = four_taxon();
        let model = JukesCantor::nucleotide();
        let graph = TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        assert_eq!(graph.n_leaves(), 4);
        assert_eq!(graph.n_nodes(), 6);
        assert_eq!(graph.n_edges(), 5);
        assert_eq!(graph.internal_edges().len(), 1);
        let internal = graph.internal_edges()[0];
        assert!((graph.edge_length(internal).unwrap() - 0.2).abs() < 1e-15);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_missing_sequence_rejected() {
        let (tree, _) = four_taxon();
        let alignment = Alignment::from_nucleotides(&[("A", "AC"), ("B", "AC"), ("C", "AC")]).unwrap();
        let model = JukesCantor::nucleotide();
        let result = TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default());
        assert!(matches!(result, Err(LikelihoodError::InvalidData(_))));
    }

    #[test]
    fn test_model_state_mismatch_rejected() {
        let (tree, alignment) = four_taxon();
        let model = JukesCantor::new(20).unwrap();
        let result = TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default());
        assert!(matches!(result, Err(LikelihoodError::Model(_))));
    }

    #[test]
    fn test_undo_without_mark_fails() {
        let (tree, alignment) = four_taxon();
        let model = JukesCantor::nucleotide();
        let mut graph = TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        assert!(graph.undo().is_err());
        graph.mark();
        assert!(graph.undo().is_ok());
    }

    #[test]
    fn test_leaf_lookup() {
        let (tree, alignment) = six_taxon();
        let model = JukesCantor::nucleotide();
        let graph = TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let e = graph.leaf_node("E").unwrap();
        assert_eq!(graph.leaf_label(e).unwrap(), Some("E"));
        assert!(graph.is_leaf(e).unwrap());
        assert_eq!(graph.node_edges(e).unwrap().len(), 1);
    }
}
