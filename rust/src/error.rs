//! Error types for the likelihood engine.
//!
//! Every detected violation aborts the current operation. A site with zero
//! probability is not an error: it shows up as `-inf` in the log-likelihood.

use thiserror::Error;

/// Errors raised by pattern building, store access, graph edits and model queries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LikelihoodError {
    /// A fixed store was asked to grow past its capacity.
    #[error("store capacity exceeded: requested {requested} patterns, capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// A kernel was handed a store smaller than the pattern count it must touch.
    #[error("pattern count mismatch: expected {expected}, store holds {actual}")]
    PatternCountMismatch { expected: usize, actual: usize },

    /// A pattern build received a child with no patterns.
    #[error("pattern build received an empty child ({side})")]
    EmptyPatterns { side: &'static str },

    /// An edit or construction would break the binary-tree invariant.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Edge index does not exist in the graph.
    #[error("unknown edge {0}")]
    UnknownEdge(usize),

    /// Node index does not exist in the graph.
    #[error("unknown node {0}")]
    UnknownNode(usize),

    /// A clock-tree node ended up below one of its children.
    #[error("height order violated at node {node}: {height} < child height {child_height}")]
    HeightOrder {
        node: usize,
        height: f64,
        child_height: f64,
    },

    /// Malformed alignment, tree or parameter input.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The substitution model cannot serve this request.
    #[error("model error: {0}")]
    Model(String),

    /// Engine configuration is inconsistent with the inputs.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, LikelihoodError>;

impl LikelihoodError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub fn invalid_topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology(message.into())
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
