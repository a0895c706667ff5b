//! Engine configuration.

use crate::error::{LikelihoodError, Result};
use crate::kernel::Kernel;

/// Branch lengths or heights closer than this are treated as unchanged.
pub const DEFAULT_DISTANCE_TOLERANCE: f64 = 1e-12;

/// Which numeric kernel the engine should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum KernelChoice {
    /// Unrolled 4-state kernel for 4-state models, generic otherwise.
    #[default]
    Auto,
    /// Always the generic N-state kernel.
    Generic,
    /// Always the unrolled 4-state kernel (model must have 4 states).
    Nucleotide,
}

/// Configuration shared by the unrooted graph and the clock tree.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Numeric kernel selection. Default: `Auto`
    pub kernel: KernelChoice,
    /// Tolerance below which a distance edit is ignored. Default: 1e-12
    pub distance_tolerance: f64,
    /// Size every store to the site count once and forbid later growth. Default: false
    pub fixed_stores: bool,
    /// Use stateless calculators that never cache transition matrices. Default: false
    pub stateless_kernels: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kernel: KernelChoice::Auto,
            distance_tolerance: DEFAULT_DISTANCE_TOLERANCE,
            fixed_stores: false,
            stateless_kernels: false,
        }
    }
}

impl EngineConfig {
    /// Resolve the kernel choice against a model's state count.
    pub fn resolve_kernel(&self, n_states: usize) -> Result<Kernel> {
        match self.kernel {
            KernelChoice::Auto if n_states == 4 => Ok(Kernel::Nucleotide),
            KernelChoice::Auto | KernelChoice::Generic => Ok(Kernel::Generic),
            KernelChoice::Nucleotide if n_states == 4 => Ok(Kernel::Nucleotide),
            KernelChoice::Nucleotide => Err(LikelihoodError::config(format!(
                "nucleotide kernel requested for a {}-state model",
                n_states
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.distance_tolerance >= 0.0) {
            return Err(LikelihoodError::config(format!(
                "distance tolerance must be non-negative, got {}",
                self.distance_tolerance
            )));
        }
        Ok(())
    }
}
