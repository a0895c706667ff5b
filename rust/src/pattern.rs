//! Site-pattern compression.
//!
//! A pattern is a class of sites that look identical from a given point in
//! the tree. Below a leaf that is simply the observed state; below an
//! internal point it is the pair of child patterns. Patterns are numbered in
//! first-occurrence order across sites, so a rebuild over the same inputs
//! reproduces the same numbering.

use crate::error::{LikelihoodError, Result};

/// Pattern-compressed view of the sites beneath one point of the tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatternInfo {
    /// `site_pattern[site]` is the pattern that site belongs to.
    site_pattern: Vec<usize>,
    /// `weights[pattern]` counts the sites in that pattern.
    weights: Vec<u32>,
    /// `lookup[2p]`, `lookup[2p + 1]`: left and right child pattern of `p`.
    lookup: Vec<usize>,
    n_patterns: usize,
    /// Pattern counts of the children this set was built from.
    child_patterns: (usize, usize),
}

impl PatternInfo {
    /// Empty info sized for `n_sites`; holds no patterns until built.
    pub fn with_sites(n_sites: usize) -> Self {
        Self {
            site_pattern: vec![0; n_sites],
            weights: Vec::with_capacity(n_sites),
            lookup: Vec::with_capacity(n_sites * 2),
            n_patterns: 0,
            child_patterns: (0, 0),
        }
    }

    /// Combine two child pattern sets into a fresh parent set.
    pub fn from_children(left: &PatternInfo, right: &PatternInfo) -> Result<Self> {
        let mut info = Self::with_sites(left.n_sites());
        info.build(left, right)?;
        Ok(info)
    }

    /// Rebuild in place from two children. Returns the number of patterns found.
    ///
    /// Each site's `(left, right)` pair is matched against the pairs seen so far
    /// in this pass; a match bumps that pattern's weight, otherwise the pair
    /// becomes the next pattern.
    pub fn build(&mut self, left: &PatternInfo, right: &PatternInfo) -> Result<usize> {
        if left.n_patterns == 0 {
            return Err(LikelihoodError::EmptyPatterns { side: "left" });
        }
        if right.n_patterns == 0 {
            return Err(LikelihoodError::EmptyPatterns { side: "right" });
        }
        let n_sites = left.n_sites();
        if right.n_sites() != n_sites {
            return Err(LikelihoodError::invalid_data(format!(
                "children cover {} and {} sites",
                n_sites,
                right.n_sites()
            )));
        }

        self.site_pattern.clear();
        self.site_pattern.resize(n_sites, 0);
        self.weights.clear();
        self.lookup.clear();

        let mut unique = 0;
        for site in 0..n_sites {
            let l = left.site_pattern[site];
            let r = right.site_pattern[site];

            let found = self
                .lookup
                .chunks_exact(2)
                .position(|pair| pair[0] == l && pair[1] == r);

            match found {
                Some(pattern) => {
                    self.weights[pattern] += 1;
                    self.site_pattern[site] = pattern;
                }
                None => {
                    self.lookup.push(l);
                    self.lookup.push(r);
                    self.weights.push(1);
                    self.site_pattern[site] = unique;
                    unique += 1;
                }
            }
        }

        self.n_patterns = unique;
        self.child_patterns = (left.n_patterns, right.n_patterns);
        Ok(unique)
    }

    #[inline]
    pub fn n_patterns(&self) -> usize {
        self.n_patterns
    }

    #[inline]
    pub fn n_sites(&self) -> usize {
        self.site_pattern.len()
    }

    pub fn weights(&self) -> &[u32] {
        &self.weights[..self.n_patterns]
    }

    pub fn site_patterns(&self) -> &[usize] {
        &self.site_pattern
    }

    #[inline]
    pub fn site_pattern(&self, site: usize) -> usize {
        self.site_pattern[site]
    }

    /// Child pattern indices `(left, right)` combined into `pattern`.
    #[inline]
    pub fn lookup(&self, pattern: usize) -> (usize, usize) {
        (self.lookup[pattern * 2], self.lookup[pattern * 2 + 1])
    }

    /// Pattern counts `(left, right)` of the children combined here.
    #[inline]
    pub fn child_pattern_counts(&self) -> (usize, usize) {
        self.child_patterns
    }

    /// Whether this set was built from children (leaves carry no lookup).
    pub fn has_lookup(&self) -> bool {
        self.lookup.len() == self.n_patterns * 2 && self.n_patterns > 0
    }

    pub fn total_weight(&self) -> u64 {
        self.weights().iter().map(|&w| w as u64).sum()
    }
}

/// Patterns of one observed sequence.
///
/// Sites with the same state collapse to one pattern; all unknown states
/// share a single pattern since their conditional vector is identical.
#[derive(Clone, Debug)]
pub struct LeafPatterns {
    info: PatternInfo,
    /// State of each pattern, `None` for unknown.
    pattern_states: Vec<Option<usize>>,
    /// `state_to_pattern[state]`; the final slot is the unknown pattern.
    state_to_pattern: Vec<Option<usize>>,
    n_states: usize,
}

impl LeafPatterns {
    /// Compress one sequence. States `>= n_states` are unknown.
    pub fn new(sequence: &[u8], n_states: usize) -> Result<Self> {
        if sequence.is_empty() {
            return Err(LikelihoodError::invalid_data("leaf sequence has no sites"));
        }

        let mut state_to_pattern = vec![None; n_states + 1];
        let mut pattern_states = Vec::new();
        let mut site_pattern = Vec::with_capacity(sequence.len());
        let mut weights: Vec<u32> = Vec::new();

        for &raw in sequence {
            let state = raw as usize;
            let slot = if state < n_states { state } else { n_states };
            let pattern = match state_to_pattern[slot] {
                Some(p) => {
                    weights[p] += 1;
                    p
                }
                None => {
                    let p = pattern_states.len();
                    state_to_pattern[slot] = Some(p);
                    pattern_states.push(if slot < n_states { Some(slot) } else { None });
                    weights.push(1);
                    p
                }
            };
            site_pattern.push(pattern);
        }

        let n_patterns = pattern_states.len();
        Ok(Self {
            info: PatternInfo {
                site_pattern,
                weights,
                lookup: Vec::new(),
                n_patterns,
                child_patterns: (0, 0),
            },
            pattern_states,
            state_to_pattern,
            n_states,
        })
    }

    pub fn info(&self) -> &PatternInfo {
        &self.info
    }

    #[inline]
    pub fn n_patterns(&self) -> usize {
        self.info.n_patterns
    }

    #[inline]
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Observed state of a pattern, `None` if unknown.
    #[inline]
    pub fn pattern_state(&self, pattern: usize) -> Option<usize> {
        self.pattern_states[pattern]
    }

    /// Pattern holding a given state index, if it occurs in the sequence.
    pub fn pattern_for_state(&self, state: u8) -> Option<usize> {
        let state = state as usize;
        let slot = if state < self.n_states { state } else { self.n_states };
        self.state_to_pattern[slot]
    }
}
