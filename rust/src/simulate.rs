//! Forward simulation of alignments down a rooted tree.
//!
//! Used to generate test data with known generating parameters. Each site
//! draws a rate category, a root state from the equilibrium distribution, and
//! then one state per node from the transition row of its parent's state.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::alignment::Alignment;
use crate::error::{LikelihoodError, Result};
use crate::model::SubstitutionModel;
use crate::tree::Tree;

/// Index drawn from a discrete distribution given by `weights`.
fn sample_index<R: Rng>(rng: &mut R, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (idx, &w) in weights.iter().enumerate() {
        if u < w {
            return idx;
        }
        u -= w;
    }
    weights.len() - 1
}

/// Simulate one site: the state of every node.
fn simulate_site<R: Rng>(
    tree: &Tree,
    model: &dyn SubstitutionModel,
    pre_order: &[usize],
    matrices: &[Vec<Vec<f64>>],
    rng: &mut R,
) -> Vec<u8> {
    let n = model.n_states();
    let category = sample_index(rng, model.category_probabilities());
    let mut states = vec![0u8; tree.n_nodes];
    for &node in pre_order {
        let state = match tree.parent(node) {
            None => sample_index(rng, model.equilibrium_frequencies()),
            Some(parent) => {
                let from = states[parent] as usize;
                let p = &matrices[node][category];
                sample_index(rng, &p[from * n..(from + 1) * n])
            }
        };
        states[node] = state as u8;
    }
    states
}

/// Simulate `n_sites` columns on `tree` under `model`.
///
/// Sites are independent and simulated in parallel; site `i` uses the seed
/// `seed + i`, so the result does not depend on the thread count.
pub fn simulate_alignment(
    tree: &Tree,
    model: &dyn SubstitutionModel,
    n_sites: usize,
    seed: u64,
) -> Result<Alignment> {
    if n_sites == 0 {
        return Err(LikelihoodError::invalid_data("cannot simulate zero sites"));
    }
    if model.n_states() > u8::MAX as usize {
        return Err(LikelihoodError::model(format!(
            "{} states do not fit in a byte",
            model.n_states()
        )));
    }

    let n = model.n_states();
    let matrices: Vec<Vec<Vec<f64>>> = (0..tree.n_nodes)
        .map(|node| {
            (0..model.n_categories())
                .map(|c| {
                    let mut p = vec![0.0; n * n];
                    if tree.parent(node).is_some() {
                        model.transition_probabilities(tree.branch_lengths[node], c, &mut p);
                    }
                    p
                })
                .collect()
        })
        .collect();
    let mut pre_order = tree.post_order();
    pre_order.reverse();

    let columns: Vec<Vec<u8>> = (0..n_sites)
        .into_par_iter()
        .map(|site| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(site as u64));
            simulate_site(tree, model, &pre_order, &matrices, &mut rng)
        })
        .collect();

    let sequences = (0..tree.n_tips)
        .map(|tip| columns.iter().map(|column| column[tip]).collect())
        .collect();
    debug!(tips = tree.n_tips, sites = n_sites, seed, "simulated alignment");
    Alignment::new(tree.tip_labels.clone(), sequences, n)
}
