//! Molecular-clock likelihood.
//!
//! Nodes carry absolute heights instead of branches carrying lengths; the
//! distance of a branch is whatever the [`HeightConverter`] makes of the two
//! heights at its ends. Each node caches two sets of conditionals:
//!
//! * descendant: the data below the node, flat at the node and extended up
//!   to its parent's height;
//! * ascendant: the data outside the node's subtree, flat at the parent's
//!   height and extended down to the node.
//!
//! Descendant and ascendant conditionals meet at any node, so the likelihood
//! can be anchored anywhere. An optional pivot attaches externally computed
//! conditionals (for instance an unconstrained subtree) at the root.

use std::collections::HashSet;
use std::mem;

use tracing::{debug, trace};

use crate::alignment::Alignment;
use crate::config::EngineConfig;
use crate::error::{LikelihoodError, Result};
use crate::kernel::{
    BranchCalculator, CalculatorFactory, ExternalCalculator, Kernel, LeafCalculator,
    TransitionMatrices,
};
use crate::model::{HeightConverter, SubstitutionModel};
use crate::pattern::PatternInfo;
use crate::store::ConditionalStore;
use crate::tree::Tree;

#[derive(Clone, Debug)]
struct NodeCache {
    patterns: PatternInfo,
    flat: ConditionalStore,
    extended: ConditionalStore,
    patterns_valid: bool,
    flat_valid: bool,
    extended_valid: bool,
    flat_computations: u64,
}

impl NodeCache {
    fn new(n_sites: usize, flat: ConditionalStore, extended: ConditionalStore) -> Self {
        Self {
            patterns: PatternInfo::with_sites(n_sites),
            flat,
            extended,
            patterns_valid: false,
            flat_valid: false,
            extended_valid: false,
            flat_computations: 0,
        }
    }

    fn invalidate(&mut self) {
        self.flat_valid = false;
        self.extended_valid = false;
    }
}

/// Conditionals attached at the root from outside the clock tree.
#[derive(Clone, Debug)]
pub struct Pivot {
    pub patterns: PatternInfo,
    pub conditionals: ConditionalStore,
}

/// Validity of one node's caches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockCacheStatus {
    pub descendant_flat_valid: bool,
    pub descendant_extended_valid: bool,
    pub ascendant_flat_valid: bool,
    pub ascendant_extended_valid: bool,
    pub descendant_flat_computations: u64,
    /// The last descendant flat write reused conditionals computed earlier.
    pub descendant_based_on_cached: bool,
    /// The last ascendant flat write reused conditionals computed earlier.
    pub ascendant_based_on_cached: bool,
}

/// Rooted binary tree under a molecular clock.
#[derive(Clone, Debug)]
pub struct ClockTree {
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    heights: Vec<f64>,
    marked_heights: Option<Vec<f64>>,
    n_tips: usize,
    root: usize,
    labels: Vec<String>,
    leaves: Vec<LeafCalculator>,
    /// Calculator for the branch above each node; the root's is unused.
    calculators: Vec<BranchCalculator>,
    descendant: Vec<NodeCache>,
    ascendant: Vec<NodeCache>,
    meet: PatternInfo,
    pivot: Option<Pivot>,
    root_patterns: PatternInfo,
    root_patterns_valid: bool,
    root_extended: ConditionalStore,
    kernel: Kernel,
    external: ExternalCalculator,
    scratch: [TransitionMatrices; 2],
    n_sites: usize,
    n_states: usize,
    n_categories: usize,
    config: EngineConfig,
    model_version: Option<u64>,
    converter_version: Option<u64>,
}

impl ClockTree {
    /// Clock tree whose heights follow from the input tree's branch lengths,
    /// with the deepest tip at height zero.
    pub fn from_tree(
        tree: &Tree,
        alignment: &Alignment,
        model: &dyn SubstitutionModel,
        config: &EngineConfig,
    ) -> Result<Self> {
        Self::with_heights(tree, tree.node_heights(), alignment, model, config)
    }

    /// Clock tree with explicit node heights.
    ///
    /// Every node must sit at or above both of its children.
    pub fn with_heights(
        tree: &Tree,
        heights: Vec<f64>,
        alignment: &Alignment,
        model: &dyn SubstitutionModel,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if heights.len() != tree.n_nodes {
            return Err(LikelihoodError::invalid_data(format!(
                "{} heights for {} nodes",
                heights.len(),
                tree.n_nodes
            )));
        }
        if tree.children[tree.root_index].len() != 2 {
            return Err(LikelihoodError::invalid_topology(
                "clock tree root must have exactly two children",
            ));
        }
        if model.n_states() != alignment.n_states() {
            return Err(LikelihoodError::model(format!(
                "model has {} states, alignment has {}",
                model.n_states(),
                alignment.n_states()
            )));
        }
        if let Some(bad) = heights.iter().find(|h| !h.is_finite()) {
            return Err(LikelihoodError::invalid_data(format!("node height {}", bad)));
        }
        for node in 0..tree.n_nodes {
            for &child in &tree.children[node] {
                if heights[node] < heights[child] {
                    return Err(LikelihoodError::HeightOrder {
                        node,
                        height: heights[node],
                        child_height: heights[child],
                    });
                }
            }
        }

        let kernel = config.resolve_kernel(model.n_states())?;
        let factory = CalculatorFactory::new(kernel, config.stateless_kernels);
        let n_sites = alignment.n_sites();
        let n_states = alignment.n_states();
        let n_categories = model.n_categories();

        let mut leaves = Vec::with_capacity(tree.n_tips);
        let mut labels = Vec::with_capacity(tree.n_tips);
        for tip in 0..tree.n_tips {
            let label = tree.tip_label(tip);
            let sequence = alignment.sequence_by_label(label).ok_or_else(|| {
                LikelihoodError::invalid_data(format!("no sequence for tip '{}'", label))
            })?;
            leaves.push(factory.leaf_calculator(sequence, n_states)?);
            labels.push(label.to_string());
        }

        let mut clock = Self {
            parent: (0..tree.n_nodes).map(|n| tree.parent(n)).collect(),
            children: tree.children.clone(),
            heights,
            marked_heights: None,
            n_tips: tree.n_tips,
            root: tree.root_index,
            labels,
            leaves,
            calculators: (0..tree.n_nodes).map(|_| factory.branch_calculator()).collect(),
            descendant: Vec::new(),
            ascendant: Vec::new(),
            meet: PatternInfo::with_sites(n_sites),
            pivot: None,
            root_patterns: PatternInfo::with_sites(n_sites),
            root_patterns_valid: false,
            root_extended: ConditionalStore::new(n_categories, n_states),
            kernel,
            external: factory.external(),
            scratch: [TransitionMatrices::default(), TransitionMatrices::default()],
            n_sites,
            n_states,
            n_categories,
            config: config.clone(),
            model_version: None,
            converter_version: None,
        };
        clock.descendant = clock.new_caches(tree.n_nodes);
        clock.ascendant = clock.new_caches(tree.n_nodes);
        clock.root_extended = clock.new_store();
        clock.build_descendant_patterns(tree)?;

        debug!(
            nodes = tree.n_nodes,
            tips = tree.n_tips,
            sites = n_sites,
            root_height = clock.heights[clock.root],
            "built clock tree"
        );
        Ok(clock)
    }

    fn new_store(&self) -> ConditionalStore {
        if self.config.fixed_stores {
            ConditionalStore::fixed(self.n_categories, self.n_states, self.n_sites)
        } else {
            ConditionalStore::new(self.n_categories, self.n_states)
        }
    }

    fn new_caches(&self, n: usize) -> Vec<NodeCache> {
        (0..n)
            .map(|_| NodeCache::new(self.n_sites, self.new_store(), self.new_store()))
            .collect()
    }

    /// Topology is fixed, so descendant patterns are built once.
    fn build_descendant_patterns(&mut self, tree: &Tree) -> Result<()> {
        for node in tree.post_order() {
            if node < self.n_tips {
                self.descendant[node]
                    .patterns
                    .clone_from(self.leaves[node].patterns().info());
            } else {
                let (l, r) = (self.children[node][0], self.children[node][1]);
                let mut info = mem::take(&mut self.descendant[node].patterns);
                let built = info.build(&self.descendant[l].patterns, &self.descendant[r].patterns);
                self.descendant[node].patterns = info;
                built?;
            }
            self.descendant[node].patterns_valid = true;
        }
        Ok(())
    }

    pub fn n_nodes(&self) -> usize {
        self.heights.len()
    }

    pub fn n_tips(&self) -> usize {
        self.n_tips
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn heights(&self) -> &[f64] {
        &self.heights
    }

    pub fn height(&self, node: usize) -> Result<f64> {
        self.heights
            .get(node)
            .copied()
            .ok_or(LikelihoodError::UnknownNode(node))
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parent.get(node).copied().flatten()
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    pub fn tip_label(&self, tip: usize) -> Option<&str> {
        self.labels.get(tip).map(|s| s.as_str())
    }

    /// Internal nodes, including the root.
    pub fn internal_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.n_tips..self.heights.len()
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.heights.len() {
            return Err(LikelihoodError::UnknownNode(node));
        }
        Ok(())
    }

    fn sibling(&self, node: usize) -> Option<usize> {
        let p = self.parent(node)?;
        self.children[p].iter().copied().find(|&c| c != node)
    }

    fn distance(&self, converter: &dyn HeightConverter, node: usize) -> f64 {
        match self.parent(node) {
            Some(p) => converter.expected_substitutions(self.heights[p], self.heights[node]),
            None => 0.0,
        }
    }

    pub fn cache_status(&self, node: usize) -> Result<ClockCacheStatus> {
        self.check_node(node)?;
        let d = &self.descendant[node];
        let a = &self.ascendant[node];
        Ok(ClockCacheStatus {
            descendant_flat_valid: d.flat_valid,
            descendant_extended_valid: d.extended_valid,
            ascendant_flat_valid: a.flat_valid,
            ascendant_extended_valid: a.extended_valid,
            descendant_flat_computations: d.flat_computations,
            descendant_based_on_cached: d.flat.is_based_on_cached_data(),
            ascendant_based_on_cached: a.flat.is_based_on_cached_data(),
        })
    }

    // ---- invalidation ----

    fn invalidate_everything(&mut self) {
        for cache in self.descendant.iter_mut().chain(self.ascendant.iter_mut()) {
            cache.invalidate();
        }
    }

    fn invalidate_ascendant_subtree(&mut self, node: usize) {
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            let cache = &mut self.ascendant[n];
            if !cache.flat_valid && !cache.extended_valid {
                continue;
            }
            cache.invalidate();
            stack.extend(self.children[n].iter().copied());
        }
    }

    /// Drop every cache that depends on the branches around `node`.
    fn invalidate_height(&mut self, node: usize) {
        for i in 0..self.children[node].len() {
            let child = self.children[node][i];
            self.descendant[child].extended_valid = false;
            self.invalidate_ascendant_subtree(child);
        }

        let mut current = Some(node);
        while let Some(n) = current {
            self.descendant[n].invalidate();
            current = self.parent(n);
        }

        self.ascendant[node].extended_valid = false;
        let mut q = node;
        while let Some(p) = self.parent(q) {
            if let Some(s) = self.sibling(q) {
                self.invalidate_ascendant_subtree(s);
            }
            q = p;
        }
    }

    fn sync(&mut self, model: &dyn SubstitutionModel, converter: &dyn HeightConverter) -> Result<()> {
        if model.n_states() != self.n_states {
            return Err(LikelihoodError::model(format!(
                "model has {} states, tree has {}",
                model.n_states(),
                self.n_states
            )));
        }
        if let Some(pivot) = &self.pivot {
            if pivot.conditionals.n_categories() != model.n_categories() {
                return Err(LikelihoodError::model(format!(
                    "pivot has {} categories, model has {}",
                    pivot.conditionals.n_categories(),
                    model.n_categories()
                )));
            }
        }
        let model_changed = self.model_version != Some(model.version());
        let converter_changed = self.converter_version != Some(converter.version());
        if !model_changed && !converter_changed {
            return Ok(());
        }
        if model.n_categories() != self.n_categories {
            self.n_categories = model.n_categories();
            let descendant = mem::take(&mut self.descendant);
            self.descendant = self.rebuild_stores(descendant);
            let ascendant = mem::take(&mut self.ascendant);
            self.ascendant = self.rebuild_stores(ascendant);
            self.root_extended = self.new_store();
        }
        self.invalidate_everything();
        self.model_version = Some(model.version());
        self.converter_version = Some(converter.version());
        debug!(model_changed, converter_changed, "clock conditionals invalidated");
        Ok(())
    }

    fn rebuild_stores(&self, mut caches: Vec<NodeCache>) -> Vec<NodeCache> {
        for cache in &mut caches {
            cache.flat = self.new_store();
            cache.extended = self.new_store();
        }
        caches
    }

    // ---- height edits ----

    /// Move an internal node. A height below the tallest child is raised to
    /// it; ancestors are raised as needed to stay above their children.
    /// Returns the height actually applied.
    pub fn set_height(&mut self, node: usize, height: f64) -> Result<f64> {
        self.check_node(node)?;
        if node < self.n_tips {
            return Err(LikelihoodError::invalid_data(format!("tip {} has a fixed height", node)));
        }
        if !height.is_finite() {
            return Err(LikelihoodError::invalid_data(format!("node height {}", height)));
        }
        let floor = self.children[node]
            .iter()
            .map(|&c| self.heights[c])
            .fold(f64::NEG_INFINITY, f64::max);
        let applied = height.max(floor);
        if (applied - self.heights[node]).abs() <= self.config.distance_tolerance {
            return Ok(self.heights[node]);
        }
        self.heights[node] = applied;
        self.invalidate_height(node);

        let mut child = node;
        let mut raised = 0;
        while let Some(p) = self.parent(child) {
            if self.heights[p] >= self.heights[child] {
                break;
            }
            self.heights[p] = self.heights[child];
            self.invalidate_height(p);
            raised += 1;
            child = p;
        }
        trace!(node, requested = height, applied, raised, "height set");
        Ok(applied)
    }

    /// Set every internal node's height, in node order, bottom-up.
    pub fn set_internal_heights(&mut self, heights: &[f64]) -> Result<()> {
        let internal: Vec<usize> = self.internal_nodes().collect();
        if heights.len() != internal.len() {
            return Err(LikelihoodError::invalid_data(format!(
                "expected {} heights, got {}",
                internal.len(),
                heights.len()
            )));
        }
        for (&node, &h) in internal.iter().zip(heights) {
            self.set_height(node, h)?;
        }
        Ok(())
    }

    pub fn mark(&mut self) {
        self.marked_heights = Some(self.heights.clone());
    }

    /// Restore heights saved by [`mark`](Self::mark).
    pub fn undo(&mut self) -> Result<()> {
        let marked = self
            .marked_heights
            .clone()
            .ok_or_else(|| LikelihoodError::invalid_data("undo without a mark"))?;
        let mut restored = 0;
        for (node, &h) in marked.iter().enumerate() {
            if self.heights[node].to_bits() != h.to_bits() {
                self.heights[node] = h;
                self.invalidate_height(node);
                restored += 1;
            }
        }
        debug!(restored, "restored marked heights");
        Ok(())
    }

    // ---- pivot ----

    /// Attach external conditionals at the root. The store must have the
    /// tree's category and state shape and cover the pattern set.
    pub fn set_pivot(&mut self, patterns: PatternInfo, conditionals: ConditionalStore) -> Result<()> {
        if patterns.n_sites() != self.n_sites {
            return Err(LikelihoodError::invalid_data(format!(
                "pivot covers {} sites, tree has {}",
                patterns.n_sites(),
                self.n_sites
            )));
        }
        if patterns.n_patterns() == 0 {
            return Err(LikelihoodError::EmptyPatterns { side: "pivot" });
        }
        if conditionals.n_states() != self.n_states {
            return Err(LikelihoodError::model(format!(
                "pivot has {} states, tree has {}",
                conditionals.n_states(),
                self.n_states
            )));
        }
        if conditionals.n_categories() != self.n_categories {
            return Err(LikelihoodError::model(format!(
                "pivot has {} categories, tree has {}",
                conditionals.n_categories(),
                self.n_categories
            )));
        }
        conditionals.patterns_for_read(patterns.n_patterns())?;
        self.pivot = Some(Pivot {
            patterns,
            conditionals,
        });
        self.pivot_changed();
        Ok(())
    }

    pub fn clear_pivot(&mut self) {
        if self.pivot.take().is_some() {
            self.pivot_changed();
        }
    }

    pub fn pivot(&self) -> Option<&Pivot> {
        self.pivot.as_ref()
    }

    fn pivot_changed(&mut self) {
        for cache in &mut self.ascendant {
            cache.patterns_valid = false;
            cache.invalidate();
        }
        self.root_patterns_valid = false;
    }

    // ---- descendant computation ----

    fn compute_descendant_extended(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
        based_on_cached: bool,
    ) -> Result<()> {
        let distance = self.distance(converter, node);
        let tolerance = self.config.distance_tolerance;
        let mut out = mem::take(&mut self.descendant[node].extended);
        let matrices =
            self.calculators[node].matrices(model, distance, tolerance, &mut self.scratch[0]);
        let result = if node < self.n_tips {
            self.leaves[node].extend(matrices, &mut out)
        } else {
            let cache = &self.descendant[node];
            self.kernel
                .extend(matrices, cache.patterns.n_patterns(), &cache.flat, &mut out, based_on_cached)
        };
        let cache = &mut self.descendant[node];
        cache.extended = out;
        result?;
        cache.extended_valid = true;
        Ok(())
    }

    /// `fresh` holds the nodes recomputed earlier in the same pass; anything
    /// else feeding this node comes from the cache.
    fn compute_descendant_flat(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
        fresh: &HashSet<usize>,
    ) -> Result<()> {
        let mut out = mem::take(&mut self.descendant[node].flat);
        let result = if node < self.n_tips {
            self.leaves[node].fill_flat(&mut out)
        } else {
            let (l, r) = (self.children[node][0], self.children[node][1]);
            let based_on_cached = !fresh.contains(&l) || !fresh.contains(&r);
            if self.config.stateless_kernels {
                let (dl, dr) = (self.distance(converter, l), self.distance(converter, r));
                self.external.extend_then_flat(
                    model,
                    &self.descendant[node].patterns,
                    &self.descendant[l].flat,
                    dl,
                    &self.descendant[r].flat,
                    dr,
                    &mut self.scratch,
                    &mut out,
                    based_on_cached,
                )
            } else {
                let mut result = Ok(());
                for child in [l, r] {
                    if result.is_ok() && !self.descendant[child].extended_valid {
                        let cached = !fresh.contains(&child);
                        result = self.compute_descendant_extended(model, converter, child, cached);
                    }
                }
                result.and_then(|_| {
                    self.kernel.flat(
                        &self.descendant[node].patterns,
                        &self.descendant[l].extended,
                        &self.descendant[r].extended,
                        &mut out,
                        based_on_cached,
                    )
                })
            }
        };
        let cache = &mut self.descendant[node];
        cache.flat = out;
        result?;
        cache.flat_valid = true;
        cache.extended_valid = false;
        cache.flat_computations += 1;
        Ok(())
    }

    fn ensure_descendant_flat(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
    ) -> Result<()> {
        let mut order = Vec::new();
        let mut stack = vec![(node, false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                order.push(n);
                continue;
            }
            if self.descendant[n].flat_valid {
                continue;
            }
            stack.push((n, true));
            for &child in self.children[n].iter().rev() {
                stack.push((child, false));
            }
        }
        let mut fresh = HashSet::with_capacity(order.len());
        for &n in &order {
            self.compute_descendant_flat(model, converter, n, &fresh)?;
            fresh.insert(n);
        }
        Ok(())
    }

    fn ensure_descendant_extended(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
    ) -> Result<()> {
        let was_valid = self.descendant[node].flat_valid;
        self.ensure_descendant_flat(model, converter, node)?;
        if !self.descendant[node].extended_valid {
            self.compute_descendant_extended(model, converter, node, was_valid)?;
        }
        Ok(())
    }

    // ---- ascendant computation ----

    fn compute_ascendant_patterns(&mut self, node: usize) -> Result<()> {
        let (Some(p), Some(s)) = (self.parent(node), self.sibling(node)) else {
            return Err(LikelihoodError::invalid_topology("root has no ascendant conditionals"));
        };
        let mut info = mem::take(&mut self.ascendant[node].patterns);
        let built = if p == self.root {
            match &self.pivot {
                Some(pivot) => info.build(&self.descendant[s].patterns, &pivot.patterns).map(|_| ()),
                None => {
                    info.clone_from(&self.descendant[s].patterns);
                    Ok(())
                }
            }
        } else {
            info.build(&self.descendant[s].patterns, &self.ascendant[p].patterns)
                .map(|_| ())
        };
        self.ascendant[node].patterns = info;
        built?;
        self.ascendant[node].patterns_valid = true;
        Ok(())
    }

    fn compute_ascendant_flat(&mut self, node: usize, based_on_cached: bool) -> Result<()> {
        let (Some(p), Some(s)) = (self.parent(node), self.sibling(node)) else {
            return Err(LikelihoodError::invalid_topology("root has no ascendant conditionals"));
        };
        let mut out = mem::take(&mut self.ascendant[node].flat);
        let patterns = &self.ascendant[node].patterns;
        let result = if p != self.root {
            self.kernel.flat(
                patterns,
                &self.descendant[s].extended,
                &self.ascendant[p].extended,
                &mut out,
                based_on_cached,
            )
        } else {
            match &self.pivot {
                Some(pivot) => self.kernel.flat(
                    patterns,
                    &self.descendant[s].extended,
                    &pivot.conditionals,
                    &mut out,
                    based_on_cached,
                ),
                None => {
                    let n = patterns.n_patterns();
                    self.descendant[s]
                        .extended
                        .patterns_for_read(n)
                        .and_then(|src| {
                            out.get_for_write(n, based_on_cached)?.assign(&src);
                            Ok(())
                        })
                }
            }
        };
        let cache = &mut self.ascendant[node];
        cache.flat = out;
        result?;
        cache.flat_valid = true;
        cache.extended_valid = false;
        Ok(())
    }

    fn compute_ascendant_extended(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
        based_on_cached: bool,
    ) -> Result<()> {
        let distance = self.distance(converter, node);
        let tolerance = self.config.distance_tolerance;
        let mut out = mem::take(&mut self.ascendant[node].extended);
        let matrices =
            self.calculators[node].matrices(model, distance, tolerance, &mut self.scratch[0]);
        let cache = &self.ascendant[node];
        let result =
            self.kernel
                .extend(matrices, cache.patterns.n_patterns(), &cache.flat, &mut out, based_on_cached);
        let cache = &mut self.ascendant[node];
        cache.extended = out;
        result?;
        cache.extended_valid = true;
        Ok(())
    }

    /// Make the ascendant conditionals of `node` valid, working down from the
    /// highest invalid ancestor.
    fn ensure_ascendant_extended(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
    ) -> Result<()> {
        let mut path = Vec::new();
        let mut n = node;
        while let Some(p) = self.parent(n) {
            if self.ascendant[n].extended_valid {
                break;
            }
            path.push(n);
            n = p;
        }
        // The first node on the path hangs below a valid ascendant cache (or
        // the root); every later one hangs below the node just recomputed.
        let mut parent_fresh = false;
        for &m in path.iter().rev() {
            let mut sibling_cached = true;
            if let Some(s) = self.sibling(m) {
                sibling_cached = self.descendant[s].extended_valid;
                self.ensure_descendant_extended(model, converter, s)?;
            }
            let parent_cached = match self.parent(m) {
                Some(p) if p == self.root => self.pivot.is_some(),
                _ => !parent_fresh,
            };
            if !self.ascendant[m].patterns_valid {
                self.compute_ascendant_patterns(m)?;
            }
            let flat_was_valid = self.ascendant[m].flat_valid;
            if !flat_was_valid {
                self.compute_ascendant_flat(m, sibling_cached || parent_cached)?;
            }
            self.compute_ascendant_extended(model, converter, m, flat_was_valid)?;
            parent_fresh = true;
        }
        Ok(())
    }

    // ---- likelihood ----

    fn ensure_root_patterns(&mut self) -> Result<()> {
        if self.root_patterns_valid {
            return Ok(());
        }
        let root = self.root;
        match &self.pivot {
            Some(pivot) => {
                self.root_patterns
                    .build(&self.descendant[root].patterns, &pivot.patterns)?;
            }
            None => {
                let (l, r) = (self.children[root][0], self.children[root][1]);
                self.root_patterns
                    .build(&self.descendant[l].patterns, &self.descendant[r].patterns)?;
            }
        }
        self.root_patterns_valid = true;
        Ok(())
    }

    /// Log-likelihood anchored at the root, including the pivot if set.
    pub fn log_likelihood(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
    ) -> Result<f64> {
        self.sync(model, converter)?;
        let root = self.root;
        self.ensure_root_patterns()?;
        match &self.pivot {
            Some(_) => {
                self.ensure_descendant_flat(model, converter, root)?;
                let pivot = self
                    .pivot
                    .as_ref()
                    .ok_or_else(|| LikelihoodError::invalid_data("pivot vanished"))?;
                self.kernel.log_likelihood(
                    model,
                    &self.root_patterns,
                    &self.descendant[root].flat,
                    &pivot.conditionals,
                )
            }
            None => {
                let (l, r) = (self.children[root][0], self.children[root][1]);
                self.ensure_descendant_extended(model, converter, l)?;
                self.ensure_descendant_extended(model, converter, r)?;
                self.kernel.log_likelihood(
                    model,
                    &self.root_patterns,
                    &self.descendant[l].extended,
                    &self.descendant[r].extended,
                )
            }
        }
    }

    /// Log-likelihood anchored at `node`, where its descendant conditionals
    /// meet the ascendant conditionals from the rest of the tree.
    pub fn log_likelihood_at(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        node: usize,
    ) -> Result<f64> {
        self.check_node(node)?;
        if node == self.root {
            return self.log_likelihood(model, converter);
        }
        self.sync(model, converter)?;
        self.ensure_descendant_flat(model, converter, node)?;
        self.ensure_ascendant_extended(model, converter, node)?;
        self.meet.build(
            &self.descendant[node].patterns,
            &self.ascendant[node].patterns,
        )?;
        self.kernel.log_likelihood(
            model,
            &self.meet,
            &self.descendant[node].flat,
            &self.ascendant[node].extended,
        )
    }

    /// Root conditionals extended across `distance`, for attaching the clock
    /// tree to something above it. Returns the pattern set and the store.
    pub fn extended_root(
        &mut self,
        model: &dyn SubstitutionModel,
        converter: &dyn HeightConverter,
        distance: f64,
    ) -> Result<(&PatternInfo, &ConditionalStore)> {
        if !(distance >= 0.0) || !distance.is_finite() {
            return Err(LikelihoodError::invalid_data(format!(
                "distance must be finite and non-negative, got {}",
                distance
            )));
        }
        self.sync(model, converter)?;
        let root = self.root;
        let (l, r) = (self.children[root][0], self.children[root][1]);
        let cached = self.descendant[l].extended_valid || self.descendant[r].extended_valid;
        self.ensure_descendant_extended(model, converter, l)?;
        self.ensure_descendant_extended(model, converter, r)?;
        self.external.flat_then_extend(
            model,
            &self.descendant[root].patterns,
            &self.descendant[l].extended,
            &self.descendant[r].extended,
            distance,
            &mut self.scratch[0],
            &mut self.root_extended,
            cached,
        )?;
        Ok((&self.descendant[root].patterns, &self.root_extended))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::model::{ConstantRate, JukesCantor, RateCategories, F81};
    use crate::pruning;

    /// (((A,B),C),(D,E)), ultrametric.
    fn five_taxon() -> (Tree, Alignment) {
        let tree = Tree::from_structure_with_labels(
            vec![5, 5, 6, 7, 7, 6, 8, 8, -1],
            vec![0.1, 0.1, 0.25, 0.2, 0.2, 0.15, 0.1, 0.15, 0.0],
            ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        let alignment = Alignment::from_nucleotides(&[
            ("A", "ACGTACGTTA"),
            ("B", "ACGTACGATA"),
            ("C", "ACCTTCGATA"),
            ("D", "TCGTTCGAAG"),
            ("E", "TCGAT-GAAG"),
        ])
        .unwrap();
        (tree, alignment)
    }

    fn model() -> F81 {
        F81::new(vec![0.3, 0.2, 0.2, 0.3])
            .unwrap()
            .with_categories(RateCategories::equal(vec![0.5, 1.5]).unwrap())
    }

    #[test]
    fn test_matches_naive_at_unit_rate() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(1.0).unwrap();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let expected = pruning::log_likelihood(&tree, &alignment, &model).unwrap();
        let ll = clock.log_likelihood(&model, &rate).unwrap();
        assert!((ll - expected).abs() < 1e-9, "{} vs {}", ll, expected);
    }

    #[test]
    fn test_every_anchor_agrees() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(1.3).unwrap();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let reference = clock.log_likelihood(&model, &rate).unwrap();
        for node in 0..clock.n_nodes() {
            let ll = clock.log_likelihood_at(&model, &rate, node).unwrap();
            assert!((ll - reference).abs() < 1e-10, "node {}", node);
        }
    }

    #[test]
    fn test_height_below_child_is_clamped() {
        let (tree, alignment) = five_taxon();
        let model = JukesCantor::nucleotide();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        // Node 6 joins (A,B) at node 5 and C.
        let floor = clock.height(5).unwrap().max(clock.height(2).unwrap());
        let applied = clock.set_height(6, -1.0).unwrap();
        assert_eq!(applied, floor);
        assert_eq!(clock.height(6).unwrap(), floor);
    }

    #[test]
    fn test_raising_node_raises_ancestors() {
        let (tree, alignment) = five_taxon();
        let model = JukesCantor::nucleotide();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        clock.set_height(5, 10.0).unwrap();
        assert_eq!(clock.height(6).unwrap(), 10.0);
        assert_eq!(clock.height(8).unwrap(), 10.0);
        for node in 0..clock.n_nodes() {
            for &child in clock.children(node) {
                assert!(clock.height(node).unwrap() >= clock.height(child).unwrap());
            }
        }
    }

    #[test]
    fn test_tip_height_is_fixed() {
        let (tree, alignment) = five_taxon();
        let model = JukesCantor::nucleotide();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        assert!(clock.set_height(0, 1.0).is_err());
        assert!(matches!(clock.set_height(42, 1.0), Err(LikelihoodError::UnknownNode(42))));
    }

    #[test]
    fn test_bad_heights_rejected() {
        let (tree, alignment) = five_taxon();
        let model = JukesCantor::nucleotide();
        let mut heights = tree.node_heights();
        heights[5] = -1.0;
        let result = ClockTree::with_heights(&tree, heights, &alignment, &model, &EngineConfig::default());
        assert!(matches!(result, Err(LikelihoodError::HeightOrder { node: 5, .. })));
    }

    #[test]
    fn test_height_edit_matches_cold() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(1.0).unwrap();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        for node in 0..clock.n_nodes() {
            clock.log_likelihood_at(&model, &rate, node).unwrap();
        }
        clock.set_height(7, 0.31).unwrap();

        // The (A,B) clade does not depend on node 7.
        assert!(clock.cache_status(5).unwrap().descendant_flat_valid);
        assert!(!clock.cache_status(8).unwrap().descendant_flat_valid);
        assert!(!clock.cache_status(5).unwrap().ascendant_flat_valid);

        let mut cold = clock.clone();
        cold.invalidate_everything();
        for node in [3, 0, 8] {
            let warm = clock.log_likelihood_at(&model, &rate, node).unwrap();
            let reference = cold.log_likelihood_at(&model, &rate, node).unwrap();
            assert!((warm - reference).abs() < 1e-12);
        }
    }

    /// Moving node 5 (the (A,B) ancestor) leaves every cache that does not
    /// see its height untouched, and those buffers are not recomputed.
    #[test]
    fn test_height_edit_is_local() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(1.0).unwrap();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        clock.log_likelihood(&model, &rate).unwrap();
        for node in 0..clock.n_nodes() {
            clock.log_likelihood_at(&model, &rate, node).unwrap();
        }
        let before: Vec<ClockCacheStatus> =
            (0..clock.n_nodes()).map(|n| clock.cache_status(n).unwrap()).collect();

        let height = clock.heights()[5] * 1.2;
        assert!(height < clock.heights()[6]);
        clock.set_height(5, height).unwrap();
        assert_eq!(clock.heights()[6], tree.node_heights()[6]);

        for node in [0, 1, 2, 3, 4, 7] {
            let status = clock.cache_status(node).unwrap();
            assert!(status.descendant_flat_valid, "node {}", node);
        }
        for node in [2, 3, 4, 7] {
            assert!(clock.cache_status(node).unwrap().descendant_extended_valid, "node {}", node);
        }
        for node in [5, 6, 8] {
            assert!(!clock.cache_status(node).unwrap().descendant_flat_valid, "node {}", node);
        }
        let above = clock.cache_status(6).unwrap();
        assert!(above.ascendant_flat_valid && above.ascendant_extended_valid);
        for node in [0, 1, 2, 3, 4, 7] {
            assert!(!clock.cache_status(node).unwrap().ascendant_extended_valid, "node {}", node);
        }

        for node in 0..clock.n_nodes() {
            clock.log_likelihood_at(&model, &rate, node).unwrap();
        }
        for node in [0, 1, 2, 3, 4, 7] {
            assert_eq!(
                clock.cache_status(node).unwrap().descendant_flat_computations,
                before[node].descendant_flat_computations,
                "node {}",
                node
            );
        }
        for node in [5, 6] {
            assert_eq!(
                clock.cache_status(node).unwrap().descendant_flat_computations,
                before[node].descendant_flat_computations + 1,
                "node {}",
                node
            );
        }
    }

    #[test]
    fn test_cached_provenance() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(1.0).unwrap();
        let cold = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();

        // A cold root evaluation builds every clade from scratch.
        let mut clock = cold.clone();
        clock.log_likelihood(&model, &rate).unwrap();
        for node in [5, 6, 7] {
            assert!(!clock.cache_status(node).unwrap().descendant_based_on_cached, "node {}", node);
        }

        // Same for a cold evaluation anchored at tip D: the path 7 -> 3 and
        // the sibling clades it needs are all computed in this call.
        let mut anchored = cold.clone();
        anchored.log_likelihood_at(&model, &rate, 3).unwrap();
        for node in [3, 7] {
            assert!(!anchored.cache_status(node).unwrap().ascendant_based_on_cached, "node {}", node);
        }

        // Node 6 is rebuilt from the new node 5 and the cached tip C.
        let height = clock.heights()[5] * 1.2;
        clock.set_height(5, height).unwrap();
        clock.log_likelihood(&model, &rate).unwrap();
        assert!(clock.cache_status(5).unwrap().descendant_based_on_cached);
        assert!(clock.cache_status(6).unwrap().descendant_based_on_cached);

        // Node 7's ascendant reuses the descendant of node 6 computed above.
        clock.log_likelihood_at(&model, &rate, 7).unwrap();
        assert!(clock.cache_status(7).unwrap().ascendant_based_on_cached);
    }

    #[test]
    fn test_pivot_shape_checked() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let leaf = CalculatorFactory::new(Kernel::Nucleotide, false)
            .leaf_calculator(&[0, 1, 2, 3, 0, 1, 2, 3, 0, 1], 4)
            .unwrap();
        let patterns = leaf.patterns().info().clone();

        let mut one_category = ConditionalStore::new(1, 4);
        leaf.fill_flat(&mut one_category).unwrap();
        let err = clock.set_pivot(patterns.clone(), one_category).unwrap_err();
        assert!(matches!(err, LikelihoodError::Model(_)));
        assert!(clock.pivot().is_none());

        let mut three_states = ConditionalStore::new(2, 3);
        three_states.get_for_write(patterns.n_patterns(), false).unwrap();
        let err = clock.set_pivot(patterns.clone(), three_states).unwrap_err();
        assert!(matches!(err, LikelihoodError::Model(_)));

        let mut matching = ConditionalStore::new(2, 4);
        leaf.extend(&TransitionMatrices::for_distance(&model, 0.2), &mut matching).unwrap();
        clock.set_pivot(patterns, matching).unwrap();
        let rate = ConstantRate::new(1.0).unwrap();
        let single = JukesCantor::nucleotide();
        let err = clock.log_likelihood(&single, &rate).unwrap_err();
        assert!(matches!(err, LikelihoodError::Model(_)));
    }

    #[test]
    fn test_rate_change_invalidates() {
        let (tree, alignment) = five_taxon();
        let model = JukesCantor::nucleotide();
        let mut rate = ConstantRate::new(1.0).unwrap();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let slow = clock.log_likelihood(&model, &rate).unwrap();
        rate.set_rate(2.0).unwrap();
        let fast = clock.log_likelihood(&model, &rate).unwrap();
        assert_ne!(slow, fast);

        let scaled: Vec<f64> = tree.branch_lengths.iter().map(|b| b * 2.0).collect();
        let doubled = Tree::from_structure_with_labels(
            tree.parent_indices.clone(),
            scaled,
            tree.tip_labels.clone(),
        )
        .unwrap();
        let expected = pruning::log_likelihood(&doubled, &alignment, &model).unwrap();
        assert!((fast - expected).abs() < 1e-9);
    }

    #[test]
    fn test_mark_undo_restores() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(1.0).unwrap();
        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let before = clock.log_likelihood(&model, &rate).unwrap();
        let heights = clock.heights().to_vec();
        clock.mark();
        clock.set_height(5, 0.5).unwrap();
        clock.log_likelihood(&model, &rate).unwrap();
        clock.undo().unwrap();
        assert_eq!(heights, clock.heights());
        assert_eq!(before.to_bits(), clock.log_likelihood(&model, &rate).unwrap().to_bits());
    }

    /// A leaf hanging off the clock root at distance `d`, fed in as a pivot,
    /// gives the likelihood of the tree with that leaf as a third root child.
    #[test]
    fn test_pivot_matches_three_way_root() {
        let (tree, _) = five_taxon();
        let alignment = Alignment::from_nucleotides(&[
            ("A", "ACGTACGTTA"),
            ("B", "ACGTACGATA"),
            ("C", "ACCTTCGATA"),
            ("D", "TCGTTCGAAG"),
            ("E", "TCGAT-GAAG"),
            ("F", "TCGATCGTTA"),
        ])
        .unwrap();
        let model = model();
        let rate = ConstantRate::new(1.0).unwrap();
        let d = 0.37;

        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let leaf = CalculatorFactory::new(Kernel::Nucleotide, false)
            .leaf_calculator(alignment.sequence_by_label("F").unwrap(), 4)
            .unwrap();
        let mut pivot = ConditionalStore::new(model.n_categories(), 4);
        leaf.extend(&TransitionMatrices::for_distance(&model, d), &mut pivot).unwrap();
        clock.set_pivot(leaf.patterns().info().clone(), pivot).unwrap();

        // ((((A,B),C),(D,E)),F) with F on a trifurcating root.
        let full = Tree::from_structure_with_labels(
            vec![6, 6, 7, 8, 8, 9, 7, 9, 9, -1],
            vec![0.1, 0.1, 0.25, 0.2, 0.2, d, 0.15, 0.1, 0.15, 0.0],
            ["A", "B", "C", "D", "E", "F"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        let expected = pruning::log_likelihood(&full, &alignment, &model).unwrap();

        let ll = clock.log_likelihood(&model, &rate).unwrap();
        assert!((ll - expected).abs() < 1e-9, "{} vs {}", ll, expected);
        for node in 0..clock.n_nodes() {
            let at = clock.log_likelihood_at(&model, &rate, node).unwrap();
            assert!((at - expected).abs() < 1e-9, "node {}", node);
        }

        clock.clear_pivot();
        let without = clock.log_likelihood(&model, &rate).unwrap();
        assert!((without - ll).abs() > 1e-6);
    }

    /// The clock tree's root extended towards a leaf gives the same answer as
    /// attaching that leaf as a pivot.
    #[test]
    fn test_extended_root_matches_pivot() {
        let (tree, _) = five_taxon();
        let alignment = Alignment::from_nucleotides(&[
            ("A", "ACGTACGTTA"),
            ("B", "ACGTACGATA"),
            ("C", "ACCTTCGATA"),
            ("D", "TCGTTCGAAG"),
            ("E", "TCGAT-GAAG"),
            ("F", "TCGATCGTTA"),
        ])
        .unwrap();
        let model = JukesCantor::nucleotide();
        let rate = ConstantRate::new(1.0).unwrap();
        let d = 0.21;

        let leaf = CalculatorFactory::new(Kernel::Nucleotide, false)
            .leaf_calculator(alignment.sequence_by_label("F").unwrap(), 4)
            .unwrap();
        let mut flat = ConditionalStore::new(1, 4);
        leaf.fill_flat(&mut flat).unwrap();
        let mut extended = ConditionalStore::new(1, 4);
        leaf.extend(&TransitionMatrices::for_distance(&model, d), &mut extended).unwrap();

        let mut clock = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let (patterns, root) = clock.extended_root(&model, &rate, d).unwrap();
        let meet = PatternInfo::from_children(patterns, leaf.patterns().info()).unwrap();
        let via_root = Kernel::Nucleotide
            .log_likelihood(&model, &meet, root, &flat)
            .unwrap();

        clock.set_pivot(leaf.patterns().info().clone(), extended).unwrap();
        let via_pivot = clock.log_likelihood(&model, &rate).unwrap();
        assert!((via_root - via_pivot).abs() < 1e-10);
    }

    #[test]
    fn test_stateless_matches_stateful() {
        let (tree, alignment) = five_taxon();
        let model = model();
        let rate = ConstantRate::new(0.8).unwrap();
        let stateless = EngineConfig {
            stateless_kernels: true,
            ..EngineConfig::default()
        };
        let mut a = ClockTree::from_tree(&tree, &alignment, &model, &EngineConfig::default()).unwrap();
        let mut b = ClockTree::from_tree(&tree, &alignment, &model, &stateless).unwrap();
        let la = a.log_likelihood(&model, &rate).unwrap();
        let lb = b.log_likelihood(&model, &rate).unwrap();
        assert!((la - lb).abs() < 1e-10);
        let node = 3;
        assert!((a.log_likelihood_at(&model, &rate, node).unwrap() - lb).abs() < 1e-10);
        assert!((b.log_likelihood_at(&model, &rate, node).unwrap() - lb).abs() < 1e-10);
    }
}
