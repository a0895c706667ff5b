//! Entry points for external search and optimisation code.
//!
//! A searcher owns one tree, one model, and (for the clock) one height
//! converter. It exposes the log-likelihood, the primitive edits, mark/undo
//! for tentative edits, and a `parameters -> -log L` function that numerical
//! optimisers can drive. Which edits to try is left to the caller.

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::alignment::Alignment;
use crate::clock::ClockTree;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::graph::{EdgeId, NniVariant, TreeGraph};
use crate::model::{HeightConverter, SubstitutionModel};
use crate::tree::Tree;

/// Maximum-likelihood host for an unrooted tree with free branch lengths.
#[derive(Debug)]
pub struct UnrootedSearcher<M: SubstitutionModel> {
    graph: TreeGraph,
    model: M,
    evaluations: u64,
}

impl<M: SubstitutionModel> UnrootedSearcher<M> {
    pub fn new(tree: &Tree, alignment: &Alignment, model: M, config: &EngineConfig) -> Result<Self> {
        let graph = TreeGraph::from_tree(tree, alignment, &model, config)?;
        Ok(Self {
            graph,
            model,
            evaluations: 0,
        })
    }

    pub fn graph(&self) -> &TreeGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TreeGraph {
        &mut self.graph
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable model access. Parameter setters bump the model version, and the
    /// next evaluation recomputes whatever depends on it.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Number of likelihood evaluations served so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    #[instrument(level = "trace", skip(self))]
    pub fn log_likelihood(&mut self) -> Result<f64> {
        self.evaluations += 1;
        self.graph.log_likelihood(&self.model)
    }

    pub fn branch_lengths(&self) -> Vec<f64> {
        self.graph.branch_lengths()
    }

    pub fn set_branch_length(&mut self, edge: EdgeId, length: f64) -> Result<bool> {
        self.graph.set_branch_length(edge, length)
    }

    pub fn nni(&mut self, edge: EdgeId, variant: NniVariant) -> Result<()> {
        self.graph.nni(edge, variant)
    }

    pub fn spr(&mut self, prune: EdgeId, side: usize, regraft: EdgeId) -> Result<()> {
        self.graph.spr(prune, side, regraft)
    }

    pub fn mark(&mut self) {
        self.graph.mark();
    }

    pub fn undo(&mut self) -> Result<()> {
        self.graph.undo()
    }

    /// `-log L` with every branch length set from `lengths`, in edge order.
    pub fn negative_log_likelihood_for(&mut self, lengths: &[f64]) -> Result<f64> {
        self.graph.set_branch_lengths(lengths)?;
        Ok(-self.log_likelihood()?)
    }

    /// Log-likelihood of the neighbour reached by an interchange, leaving the
    /// tree as it was. Replaces any existing mark.
    #[instrument(level = "debug", skip(self, edge), fields(edge = edge.0))]
    pub fn evaluate_nni(&mut self, edge: EdgeId, variant: NniVariant) -> Result<f64> {
        self.graph.mark();
        self.graph.nni(edge, variant)?;
        let trial = self.log_likelihood();
        self.graph.undo()?;
        let ll = trial?;
        debug!(ll, "nni trial");
        Ok(ll)
    }
}

/// Host for a clock tree: parameters are internal node heights.
#[derive(Debug)]
pub struct ClockSearcher<M: SubstitutionModel, C: HeightConverter> {
    tree: ClockTree,
    model: M,
    converter: C,
    evaluations: u64,
}

impl<M: SubstitutionModel, C: HeightConverter> ClockSearcher<M, C> {
    pub fn new(
        tree: &Tree,
        alignment: &Alignment,
        model: M,
        converter: C,
        config: &EngineConfig,
    ) -> Result<Self> {
        let tree = ClockTree::from_tree(tree, alignment, &model, config)?;
        Ok(Self {
            tree,
            model,
            converter,
            evaluations: 0,
        })
    }

    pub fn tree(&self) -> &ClockTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ClockTree {
        &mut self.tree
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn converter(&self) -> &C {
        &self.converter
    }

    pub fn converter_mut(&mut self) -> &mut C {
        &mut self.converter
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    #[instrument(level = "trace", skip(self))]
    pub fn log_likelihood(&mut self) -> Result<f64> {
        self.evaluations += 1;
        self.tree.log_likelihood(&self.model, &self.converter)
    }

    pub fn set_height(&mut self, node: usize, height: f64) -> Result<f64> {
        self.tree.set_height(node, height)
    }

    pub fn internal_heights(&self) -> Vec<f64> {
        self.tree
            .internal_nodes()
            .map(|n| self.tree.heights()[n])
            .collect()
    }

    pub fn mark(&mut self) {
        self.tree.mark();
    }

    pub fn undo(&mut self) -> Result<()> {
        self.tree.undo()
    }

    /// `-log L` with internal heights set from `heights`, in node order.
    pub fn negative_log_likelihood_for(&mut self, heights: &[f64]) -> Result<f64> {
        self.tree.set_internal_heights(heights)?;
        Ok(-self.log_likelihood()?)
    }
}

/// Evaluate many candidate trees against one alignment in parallel.
///
/// Each tree gets its own graph, so no caches are shared between threads.
pub fn evaluate_batch<M: SubstitutionModel>(
    trees: &[Tree],
    alignment: &Alignment,
    model: &M,
    config: &EngineConfig,
) -> Vec<Result<f64>> {
    trees
        .par_iter()
        .map(|tree| {
            let mut graph = TreeGraph::from_tree(tree, alignment, model, config)?;
            graph.log_likelihood(model)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConstantRate, JukesCantor};
    use crate::pruning;

    fn data() -> (Tree, Alignment) {
        let tree = Tree::from_structure_with_labels(
            vec![4, 4, 5, 5, 6, 6, -1],
            vec![0.1; 7],
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
        )
        .unwrap();
        let alignment = Alignment::from_nucleotides(&[
            ("A", "AACGTTGCA"),
            ("B", "AACGATGCA"),
            ("C", "GGCGTTGAA"),
            ("D", "GGCGATGAA"),
        ])
        .unwrap();
        (tree, alignment)
    }

    #[test]
    fn test_negative_log_likelihood_for() {
        let (tree, alignment) = data();
        let mut searcher =
            UnrootedSearcher::new(&tree, &alignment, JukesCantor::nucleotide(), &EngineConfig::default())
                .unwrap();
        let ll = searcher.log_likelihood().unwrap();
        let lengths = searcher.branch_lengths();
        let nll = searcher.negative_log_likelihood_for(&lengths).unwrap();
        assert_eq!(ll.to_bits(), (-nll).to_bits());

        let longer: Vec<f64> = lengths.iter().map(|l| l * 3.0).collect();
        let nll_longer = searcher.negative_log_likelihood_for(&longer).unwrap();
        assert_ne!(nll, nll_longer);
        assert_eq!(searcher.evaluations(), 3);
    }

    #[test]
    fn test_evaluate_nni_leaves_tree_unchanged() {
        let (tree, alignment) = data();
        let mut searcher =
            UnrootedSearcher::new(&tree, &alignment, JukesCantor::nucleotide(), &EngineConfig::default())
                .unwrap();
        let before = searcher.log_likelihood().unwrap();
        let edge = searcher.graph().internal_edges()[0];
        let neighbour = searcher.evaluate_nni(edge, NniVariant::SwapFirst).unwrap();
        assert!(neighbour.is_finite());
        assert_eq!(before.to_bits(), searcher.log_likelihood().unwrap().to_bits());
    }

    #[test]
    fn test_clock_searcher_heights() {
        let (tree, alignment) = data();
        let mut searcher = ClockSearcher::new(
            &tree,
            &alignment,
            JukesCantor::nucleotide(),
            ConstantRate::new(1.0).unwrap(),
            &EngineConfig::default(),
        )
        .unwrap();
        let heights = searcher.internal_heights();
        assert_eq!(heights, vec![0.1, 0.1, 0.2]);
        let ll = searcher.log_likelihood().unwrap();
        let nll = searcher.negative_log_likelihood_for(&heights).unwrap();
        assert!((ll + nll).abs() < 1e-12);

        searcher.converter_mut().set_rate(0.5).unwrap();
        let slower = searcher.log_likelihood().unwrap();
        assert_ne!(ll, slower);
    }

    #[test]
    fn test_evaluate_batch_matches_naive() {
        let (tree, alignment) = data();
        let other = Tree::from_structure_with_labels(
            vec![4, 4, 5, 5, 6, 6, -1],
            vec![0.1; 7],
            vec!["A".into(), "C".into(), "B".into(), "D".into()],
        )
        .unwrap();
        let model = JukesCantor::nucleotide();
        let results = evaluate_batch(
            &[tree.clone(), other.clone()],
            &alignment,
            &model,
            &EngineConfig::default(),
        );
        for (result, t) in results.iter().zip([&tree, &other]) {
            let expected = pruning::log_likelihood(t, &alignment, &model).unwrap();
            let ll = result.as_ref().unwrap();
            assert!((ll - expected).abs() < 1e-10);
        }
        assert!(results[0].as_ref().unwrap() > results[1].as_ref().unwrap());
    }
}
