//! Plain Felsenstein pruning, one site at a time.
//!
//! Computes the log-likelihood of an alignment on a rooted tree with no
//! pattern compression and no caching. It is the reference the cached
//! engine is checked against, and it accepts any number of children per node.

use crate::alignment::Alignment;
use crate::error::{LikelihoodError, Result};
use crate::model::SubstitutionModel;
use crate::tree::Tree;

/// Transition matrices for every non-root branch, one per rate category.
///
/// `matrices[node][category]` is row-major `n_states × n_states`.
fn branch_matrices(tree: &Tree, model: &dyn SubstitutionModel) -> Vec<Vec<Vec<f64>>> {
    let n = model.n_states();
    (0..tree.n_nodes)
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
        .collect()
}

/// Per-site log-likelihoods.
///
/// # Algorithm
/// 1. Tip conditionals: L[tip, s] = 1 if s is the observed state, else 0;
///    all ones for an unknown state
/// 2. Post-order: L[node, s] = ∏_{children} ∑_{s'} P[s→s'](t) · L[child, s']
/// 3. Site likelihood: ∑_c w_c ∑_s π[s] · L_c[root, s]
pub fn site_log_likelihoods(
    tree: &Tree,
    alignment: &Alignment,
    model: &dyn SubstitutionModel,
) -> Result<Vec<f64>> {
    let n_states = model.n_states();
    if n_states != alignment.n_states() {
        return Err(LikelihoodError::model(format!(
            "model has {} states, alignment has {}",
            n_states,
            alignment.n_states()
        )));
    }

    let mut tip_rows = Vec::with_capacity(tree.n_tips);
    for tip in 0..tree.n_tips {
        let label = tree.tip_label(tip);
        let row = alignment.sequence_by_label(label).ok_or_else(|| {
            LikelihoodError::invalid_data(format!("no sequence for tip '{}'", label))
        })?;
        tip_rows.push(row);
    }

    let matrices = branch_matrices(tree, model);
    let post_order = tree.post_order();
    let freqs = model.equilibrium_frequencies();
    let cat_probs = model.category_probabilities();

    let mut sites = Vec::with_capacity(alignment.n_sites());
    // conditionals[node][state] = P(data below node | node in state)
    let mut conditionals = vec![vec![0.0; n_states]; tree.n_nodes];

    for site in 0..alignment.n_sites() {
        let mut site_likelihood = 0.0;
        for (c, &weight) in cat_probs.iter().enumerate() {
            for &node in &post_order {
                if tree.is_tip(node) {
                    let observed = tip_rows[node][site] as usize;
                    for (s, value) in conditionals[node].iter_mut().enumerate() {
                        *value = if observed >= n_states || observed == s { 1.0 } else { 0.0 };
                    }
                    continue;
                }

                let mut combined = vec![1.0; n_states];
                for &child in &tree.children[node] {
                    let p = &matrices[child][c];
                    for (parent_state, value) in combined.iter_mut().enumerate() {
                        let row = &p[parent_state * n_states..(parent_state + 1) * n_states];
                        let contrib: f64 = row
                            .iter()
                            .zip(&conditionals[child])
                            .map(|(pij, lj)| pij * lj)
                            .sum();
                        *value *= contrib;
                    }
                }
                conditionals[node] = combined;
            }

            let root = &conditionals[tree.root_index];
            let at_root: f64 = freqs.iter().zip(root).map(|(pi, l)| pi * l).sum();
            site_likelihood += weight * at_root;
        }
        sites.push(site_likelihood.ln());
    }
    Ok(sites)
}

/// Total log-likelihood, the sum of [`site_log_likelihoods`].
pub fn log_likelihood(tree: &Tree, alignment: &Alignment, model: &dyn SubstitutionModel) -> Result<f64> {
    Ok(site_log_likelihoods(tree, alignment, model)?.iter().sum())
}
