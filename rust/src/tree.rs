//! Rooted input trees in parent-index form.
//!
//! This is the shape trees arrive in from callers. The likelihood engine
//! turns it into an unrooted graph or a clock tree.

use std::collections::HashMap;

use crate::error::{LikelihoodError, Result};

/// Binary rooted tree. Nodes are indexed 0..n_nodes, tips first.
#[derive(Debug, Clone)]
pub struct Tree {
    pub n_nodes: usize,
    pub n_tips: usize,
    pub parent_indices: Vec<i32>,
    pub branch_lengths: Vec<f64>,
    pub children: Vec<Vec<usize>>,
    pub tip_indices: Vec<usize>,
    pub root_index: usize,
    pub tip_labels: Vec<String>,
    pub tip_name_to_idx: HashMap<String, usize>,
}

impl Tree {
    /// Build tree from structure arrays.
    ///
    /// # Arguments
    /// * `parent_indices` - Parent index for each node (-1 for root)
    /// * `branch_lengths` - Branch length for each node (root's is ignored)
    /// * `n_tips` - Number of tip nodes, which must be indices 0..n_tips
    pub fn from_structure(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        n_tips: usize,
    ) -> Result<Self> {
        let labels = (0..n_tips).map(|i| format!("t{}", i)).collect();
        Self::from_structure_with_labels(parent_indices, branch_lengths, labels)
    }

    /// Build tree from structure arrays with one label per tip.
    pub fn from_structure_with_labels(
        parent_indices: Vec<i32>,
        branch_lengths: Vec<f64>,
        tip_labels: Vec<String>,
    ) -> Result<Self> {
        let n_nodes = parent_indices.len();
        let n_tips = tip_labels.len();

        if branch_lengths.len() != n_nodes {
            return Err(LikelihoodError::invalid_data(
                "parent_indices and branch_lengths must have same length",
            ));
        }
        if n_tips < 2 || n_tips > n_nodes {
            return Err(LikelihoodError::invalid_data(format!(
                "{} tips for {} nodes",
                n_tips, n_nodes
            )));
        }

        // Build children lists
        let mut children = vec![Vec::new(); n_nodes];
        let mut root_index = None;
        for (child_idx, &parent_idx) in parent_indices.iter().enumerate() {
            if parent_idx < 0 {
                if root_index.replace(child_idx).is_some() {
                    return Err(LikelihoodError::invalid_topology("more than one root"));
                }
                continue;
            }
            let parent = parent_idx as usize;
            if parent >= n_nodes || parent == child_idx {
                return Err(LikelihoodError::invalid_topology(format!(
                    "node {} has invalid parent {}",
                    child_idx, parent_idx
                )));
            }
            if !(branch_lengths[child_idx] >= 0.0) {
                return Err(LikelihoodError::invalid_data(format!(
                    "branch length of node {} is {}",
                    child_idx, branch_lengths[child_idx]
                )));
            }
            children[parent].push(child_idx);
        }

        let root_index = root_index
            .ok_or_else(|| LikelihoodError::invalid_topology("no root node found (no node with parent -1)"))?;

        let mut tip_name_to_idx = HashMap::with_capacity(n_tips);
        for (idx, label) in tip_labels.iter().enumerate() {
            if tip_name_to_idx.insert(label.clone(), idx).is_some() {
                return Err(LikelihoodError::invalid_data(format!("duplicate tip label '{}'", label)));
            }
        }

        let tree = Tree {
            n_nodes,
            n_tips,
            parent_indices,
            branch_lengths,
            children,
            tip_indices: (0..n_tips).collect(),
            root_index,
            tip_labels,
            tip_name_to_idx,
        };
        tree.validate_binary()?;
        Ok(tree)
    }

    /// Tips are leaves, internal nodes have two children, and the root has
    /// two or three. Every node must be reachable from the root.
    fn validate_binary(&self) -> Result<()> {
        for node in 0..self.n_nodes {
            let n_children = self.children[node].len();
            let ok = if node < self.n_tips {
                n_children == 0
            } else if node == self.root_index {
                n_children == 2 || n_children == 3
            } else {
                n_children == 2
            };
            if !ok {
                return Err(LikelihoodError::invalid_topology(format!(
                    "node {} has {} children",
                    node, n_children
                )));
            }
        }
        if self.post_order().len() != self.n_nodes {
            return Err(LikelihoodError::invalid_topology("tree is not connected"));
        }
        Ok(())
    }

    #[inline]
    pub fn is_tip(&self, node: usize) -> bool {
        node < self.n_tips
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        let p = self.parent_indices[node];
        if p < 0 {
            None
        } else {
            Some(p as usize)
        }
    }

    /// Get post-order traversal of nodes (tips to root).
    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.n_nodes);
        let mut visited = vec![false; self.n_nodes];
        let mut stack = vec![(self.root_index, false)];

        // Iterative so deep caterpillar trees cannot overflow the stack
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if visited[node] {
                continue;
            }
            visited[node] = true;
            stack.push((node, true));
            for &child in self.children[node].iter().rev() {
                stack.push((child, false));
            }
        }
        order
    }

    /// Distance from the root to every node.
    pub fn root_distances(&self) -> Vec<f64> {
        let mut depth = vec![0.0; self.n_nodes];
        for &node in self.post_order().iter().rev() {
            if let Some(parent) = self.parent(node) {
                depth[node] = depth[parent] + self.branch_lengths[node];
            }
        }
        depth
    }

    /// Node heights measured back from the deepest tip (which sits at 0).
    pub fn node_heights(&self) -> Vec<f64> {
        let depth = self.root_distances();
        let max_depth = self.tip_indices.iter().map(|&t| depth[t]).fold(0.0, f64::max);
        depth.iter().map(|&d| max_depth - d).collect()
    }

    pub fn tip_label(&self, tip: usize) -> &str {
        &self.tip_labels[tip]
    }

    pub fn tip_index(&self, label: &str) -> Option<usize> {
        self.tip_name_to_idx.get(label).copied()
    }

    /// Sum of all branch lengths below the root.
    pub fn total_length(&self) -> f64 {
        (0..self.n_nodes)
            .filter(|&n| n != self.root_index)
            .map(|n| self.branch_lengths[n])
            .sum()
    }
}
