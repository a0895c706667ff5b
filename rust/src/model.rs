//! Substitution models and clock height converters.
//!
//! The engine only asks a model for transition matrices, equilibrium
//! frequencies and category weights. Change detection works through
//! `version()`: every parameter setter draws a fresh value from a process-wide
//! counter, so two distinct model states never share a version.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LikelihoodError, Result};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Draw a new, never-before-used model version.
pub fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Continuous-time Markov model of character substitution.
pub trait SubstitutionModel: Send + Sync {
    fn n_states(&self) -> usize;

    fn n_categories(&self) -> usize;

    /// Stationary distribution, length `n_states`.
    fn equilibrium_frequencies(&self) -> &[f64];

    /// Mixture weights, length `n_categories`, summing to one.
    fn category_probabilities(&self) -> &[f64];

    /// Fill `out` (row-major `n_states × n_states`) with `P[i][j](distance)`
    /// for one rate category: ancestor state `i`, descendant state `j`.
    fn transition_probabilities(&self, distance: f64, category: usize, out: &mut [f64]);

    /// Changes whenever any parameter changes.
    fn version(&self) -> u64;
}

/// Discrete rate categories of a mixture model.
#[derive(Clone, Debug, PartialEq)]
pub struct RateCategories {
    rates: Vec<f64>,
    probabilities: Vec<f64>,
}

impl Default for RateCategories {
    fn default() -> Self {
        Self::single()
    }
}

impl RateCategories {
    /// One category with rate 1.
    pub fn single() -> Self {
        Self {
            rates: vec![1.0],
            probabilities: vec![1.0],
        }
    }

    pub fn new(rates: Vec<f64>, probabilities: Vec<f64>) -> Result<Self> {
        if rates.is_empty() || rates.len() != probabilities.len() {
            return Err(LikelihoodError::model(format!(
                "{} rates but {} category probabilities",
                rates.len(),
                probabilities.len()
            )));
        }
        if rates.iter().any(|&r| !(r >= 0.0) || !r.is_finite()) {
            return Err(LikelihoodError::model("category rates must be finite and non-negative"));
        }
        if probabilities.iter().any(|&p| !(p >= 0.0)) {
            return Err(LikelihoodError::model("category probabilities must be non-negative"));
        }
        let total: f64 = probabilities.iter().sum();
        if (total - 1.0).abs() > 1e-8 {
            return Err(LikelihoodError::model(format!(
                "category probabilities sum to {}, expected 1",
                total
            )));
        }
        Ok(Self {
            rates,
            probabilities,
        })
    }

    /// Equally weighted categories.
    pub fn equal(rates: Vec<f64>) -> Result<Self> {
        let n = rates.len().max(1);
        let probabilities = vec![1.0 / n as f64; rates.len()];
        Self::new(rates, probabilities)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    #[inline]
    pub fn rate(&self, category: usize) -> f64 {
        self.rates[category]
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }
}

/// F81 transition matrix: `P[i][j] = π_j + (δ_ij − π_j)·exp(−β·t)`.
fn f81_matrix(freqs: &[f64], beta: f64, t: f64, out: &mut [f64]) {
    let n = freqs.len();
    let decay = (-beta * t).exp();
    for i in 0..n {
        let row = &mut out[i * n..(i + 1) * n];
        for (j, cell) in row.iter_mut().enumerate() {
            let delta = if i == j { 1.0 } else { 0.0 };
            *cell = freqs[j] + (delta - freqs[j]) * decay;
        }
    }
}

/// Jukes–Cantor model over `n_states` equiprobable states.
#[derive(Clone, Debug)]
pub struct JukesCantor {
    n_states: usize,
    frequencies: Vec<f64>,
    categories: RateCategories,
    version: u64,
}

impl JukesCantor {
    pub fn new(n_states: usize) -> Result<Self> {
        if n_states < 2 {
            return Err(LikelihoodError::model(format!(
                "Jukes-Cantor needs at least 2 states, got {}",
                n_states
            )));
        }
        Ok(Self {
            n_states,
            frequencies: vec![1.0 / n_states as f64; n_states],
            categories: RateCategories::single(),
            version: next_version(),
        })
    }

    /// JC69 over nucleotides.
    pub fn nucleotide() -> Self {
        Self {
            n_states: 4,
            frequencies: vec![0.25; 4],
            categories: RateCategories::single(),
            version: next_version(),
        }
    }

    pub fn with_categories(mut self, categories: RateCategories) -> Self {
        self.set_categories(categories);
        self
    }

    pub fn set_categories(&mut self, categories: RateCategories) {
        self.categories = categories;
        self.version = next_version();
    }

    pub fn categories(&self) -> &RateCategories {
        &self.categories
    }
}

impl SubstitutionModel for JukesCantor {
    fn n_states(&self) -> usize {
        self.n_states
    }

    fn n_categories(&self) -> usize {
        self.categories.len()
    }

    fn equilibrium_frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn category_probabilities(&self) -> &[f64] {
        self.categories.probabilities()
    }

    fn transition_probabilities(&self, distance: f64, category: usize, out: &mut [f64]) {
        let n = self.n_states as f64;
        let beta = n / (n - 1.0);
        let t = distance * self.categories.rate(category);
        f81_matrix(&self.frequencies, beta, t, out);
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Felsenstein 1981 model: arbitrary stationary frequencies, equal exchange.
///
/// Scaled so that one unit of distance is one expected substitution.
#[derive(Clone, Debug)]
pub struct F81 {
    frequencies: Vec<f64>,
    beta: f64,
    categories: RateCategories,
    version: u64,
}

impl F81 {
    pub fn new(frequencies: Vec<f64>) -> Result<Self> {
        let beta = Self::normalising_rate(&frequencies)?;
        Ok(Self {
            frequencies,
            beta,
            categories: RateCategories::single(),
            version: next_version(),
        })
    }

    pub fn with_categories(mut self, categories: RateCategories) -> Self {
        self.set_categories(categories);
        self
    }

    fn normalising_rate(frequencies: &[f64]) -> Result<f64> {
        if frequencies.len() < 2 {
            return Err(LikelihoodError::model("F81 needs at least 2 states"));
        }
        if frequencies.iter().any(|&f| !(f > 0.0)) {
            return Err(LikelihoodError::model("equilibrium frequencies must be positive"));
        }
        let total: f64 = frequencies.iter().sum();
        if (total - 1.0).abs() > 1e-8 {
            return Err(LikelihoodError::model(format!(
                "equilibrium frequencies sum to {}, expected 1",
                total
            )));
        }
        let sum_sq: f64 = frequencies.iter().map(|f| f * f).sum();
        Ok(1.0 / (1.0 - sum_sq))
    }

    /// Replace the stationary distribution. Length must stay the same.
    pub fn set_frequencies(&mut self, frequencies: Vec<f64>) -> Result<()> {
        if frequencies.len() != self.frequencies.len() {
            return Err(LikelihoodError::model(format!(
                "expected {} frequencies, got {}",
                self.frequencies.len(),
                frequencies.len()
            )));
        }
        self.beta = Self::normalising_rate(&frequencies)?;
        self.frequencies = frequencies;
        self.version = next_version();
        Ok(())
    }

    pub fn set_categories(&mut self, categories: RateCategories) {
        self.categories = categories;
        self.version = next_version();
    }
}

impl SubstitutionModel for F81 {
    fn n_states(&self) -> usize {
        self.frequencies.len()
    }

    fn n_categories(&self) -> usize {
        self.categories.len()
    }

    fn equilibrium_frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn category_probabilities(&self) -> &[f64] {
        self.categories.probabilities()
    }

    fn transition_probabilities(&self, distance: f64, category: usize, out: &mut [f64]) {
        let t = distance * self.categories.rate(category);
        f81_matrix(&self.frequencies, self.beta, t, out);
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Converts a clock-tree time interval into an expected substitution distance.
pub trait HeightConverter: Send + Sync {
    fn expected_substitutions(&self, top_height: f64, bottom_height: f64) -> f64;

    fn version(&self) -> u64;
}

/// Strict clock: distance is `rate × (top − bottom)`.
#[derive(Clone, Debug)]
pub struct ConstantRate {
    rate: f64,
    version: u64,
}

impl ConstantRate {
    pub fn new(rate: f64) -> Result<Self> {
        if !(rate >= 0.0) || !rate.is_finite() {
            return Err(LikelihoodError::model(format!("clock rate must be non-negative, got {}", rate)));
        }
        Ok(Self {
            rate,
            version: next_version(),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        if !(rate >= 0.0) || !rate.is_finite() {
            return Err(LikelihoodError::model(format!("clock rate must be non-negative, got {}", rate)));
        }
        self.rate = rate;
        self.version = next_version();
        Ok(())
    }
}

impl HeightConverter for ConstantRate {
    fn expected_substitutions(&self, top_height: f64, bottom_height: f64) -> f64 {
        self.rate * (top_height - bottom_height)
    }

    fn version(&self) -> u64 {
        self.version
    }
}
