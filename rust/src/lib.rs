//! Pattern-compressed, cached phylogenetic likelihood engine.
//!
//! Sites are compressed into patterns at every point of the tree, conditional
//! probabilities are cached per direction, and an edit to a branch length,
//! a node height or the topology only clears the caches that depend on it.
//!
//! Two tree shapes are supported:
//! - [`TreeGraph`]: unrooted, free branch lengths, NNI/SPR edits with mark/undo;
//! - [`ClockTree`]: rooted, node heights under a molecular clock, with an
//!   optional pivot for conditionals attached from outside.

pub mod alignment;
pub mod clock;
pub mod config;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod model;
pub mod pattern;
pub mod pruning;
pub mod search;
pub mod simulate;
pub mod store;
pub mod tree;

#[cfg(feature = "python")]
mod python;

pub use alignment::{Alignment, UNKNOWN_STATE};
pub use clock::{ClockCacheStatus, ClockTree, Pivot};
pub use config::{EngineConfig, KernelChoice, DEFAULT_DISTANCE_TOLERANCE};
pub use error::{LikelihoodError, Result};
pub use graph::{EdgeId, HalfEdgeStatus, NniVariant, NodeId, TreeGraph};
pub use kernel::{CalculatorFactory, Kernel, TransitionMatrices};
pub use model::{ConstantRate, F81, HeightConverter, JukesCantor, RateCategories, SubstitutionModel};
pub use pattern::{LeafPatterns, PatternInfo};
pub use search::{evaluate_batch, ClockSearcher, UnrootedSearcher};
pub use simulate::simulate_alignment;
pub use store::ConditionalStore;
pub use tree::Tree;
