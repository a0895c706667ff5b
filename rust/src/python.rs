//! Python bindings, built with the `python` feature.
//!
//! Trees arrive in parent-index form (tips first, `-1` for the root) and
//! sequences as nucleotide strings in tip order. The model is F81 with the
//! given frequencies, or Jukes-Cantor when none are given.

use numpy::{PyArray1, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::wrap_pyfunction;

use crate::alignment::{nucleotide_state, Alignment};
use crate::config::EngineConfig;
use crate::error::LikelihoodError;
use crate::graph::TreeGraph;
use crate::model::{RateCategories, F81};
use crate::pruning;
use crate::search::evaluate_batch;
use crate::tree::Tree;

fn to_py_err(e: LikelihoodError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn build_alignment(tip_labels: &[String], sequences: &[String]) -> PyResult<Alignment> {
    let rows = sequences
        .iter()
        .map(|s| s.bytes().map(nucleotide_state).collect())
        .collect();
    Alignment::new(tip_labels.to_vec(), rows, 4).map_err(to_py_err)
}

fn build_model(frequencies: Option<Vec<f64>>, rates: Option<Vec<f64>>) -> PyResult<F81> {
    let model = F81::new(frequencies.unwrap_or_else(|| vec![0.25; 4])).map_err(to_py_err)?;
    match rates {
        Some(rates) => Ok(model.with_categories(RateCategories::equal(rates).map_err(to_py_err)?)),
        None => Ok(model),
    }
}

/// Log-likelihood of an alignment on one tree.
///
/// # Arguments
/// * `parent_indices` - Parent index for each node (-1 for root)
/// * `branch_lengths` - Branch length for each node
/// * `tip_labels` - One label per tip, in node order
/// * `sequences` - Nucleotide string per tip, same order
/// * `frequencies` - Optional equilibrium frequencies (A, C, G, T)
/// * `rates` - Optional equally weighted rate categories
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, tip_labels, sequences, frequencies=None, rates=None))]
fn compute_log_likelihood(
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    tip_labels: Vec<String>,
    sequences: Vec<String>,
    frequencies: Option<Vec<f64>>,
    rates: Option<Vec<f64>>,
) -> PyResult<f64> {
    let tree = Tree::from_structure_with_labels(
        parent_indices.as_array().to_vec(),
        branch_lengths.as_array().to_vec(),
        tip_labels.clone(),
    )
    .map_err(to_py_err)?;
    let alignment = build_alignment(&tip_labels, &sequences)?;
    let model = build_model(frequencies, rates)?;
    let mut graph =
        TreeGraph::from_tree(&tree, &alignment, &model, &EngineConfig::default()).map_err(to_py_err)?;
    graph.log_likelihood(&model).map_err(to_py_err)
}

/// Log-likelihoods of one alignment on many trees, computed in parallel.
///
/// # Arguments
/// * `parent_indices` - (n_trees, n_nodes) parent indices
/// * `branch_lengths` - (n_trees, n_nodes) branch lengths
/// * `tip_labels`, `sequences`, `frequencies`, `rates` - as for `compute_log_likelihood`
///
/// # Returns
/// * Vector of log-likelihoods, one per tree
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, tip_labels, sequences, frequencies=None, rates=None))]
fn compute_log_likelihoods_parallel<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray2<i32>,
    branch_lengths: PyReadonlyArray2<f64>,
    tip_labels: Vec<String>,
    sequences: Vec<String>,
    frequencies: Option<Vec<f64>>,
    rates: Option<Vec<f64>>,
) -> PyResult<&'py PyArray1<f64>> {
    let parents = parent_indices.as_array();
    let lengths = branch_lengths.as_array();
    if parents.shape() != lengths.shape() {
        return Err(PyValueError::new_err(
            "parent_indices and branch_lengths must have the same shape",
        ));
    }

    let trees = parents
        .outer_iter()
        .zip(lengths.outer_iter())
        .map(|(p, l)| Tree::from_structure_with_labels(p.to_vec(), l.to_vec(), tip_labels.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(to_py_err)?;
    let alignment = build_alignment(&tip_labels, &sequences)?;
    let model = build_model(frequencies, rates)?;

    let results = py.allow_threads(|| {
        evaluate_batch(&trees, &alignment, &model, &EngineConfig::default())
    });
    let log_likelihoods = results
        .into_iter()
        .collect::<Result<Vec<f64>, _>>()
        .map_err(to_py_err)?;
    Ok(PyArray1::from_vec(py, log_likelihoods))
}

/// Per-site log-likelihoods, without pattern compression.
#[pyfunction]
#[pyo3(signature = (parent_indices, branch_lengths, tip_labels, sequences, frequencies=None, rates=None))]
fn compute_site_log_likelihoods<'py>(
    py: Python<'py>,
    parent_indices: PyReadonlyArray1<i32>,
    branch_lengths: PyReadonlyArray1<f64>,
    tip_labels: Vec<String>,
    sequences: Vec<String>,
    frequencies: Option<Vec<f64>>,
    rates: Option<Vec<f64>>,
) -> PyResult<&'py PyArray1<f64>> {
    let tree = Tree::from_structure_with_labels(
        parent_indices.as_array().to_vec(),
        branch_lengths.as_array().to_vec(),
        tip_labels.clone(),
    )
    .map_err(to_py_err)?;
    let alignment = build_alignment(&tip_labels, &sequences)?;
    let model = build_model(frequencies, rates)?;
    let sites = pruning::site_log_likelihoods(&tree, &alignment, &model).map_err(to_py_err)?;
    Ok(PyArray1::from_vec(py, sites))
}

#[pymodule]
fn phylolik(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_log_likelihood, m)?)?;
    m.add_function(wrap_pyfunction!(compute_log_likelihoods_parallel, m)?)?;
    m.add_function(wrap_pyfunction!(compute_site_log_likelihoods, m)?)?;
    Ok(())
}
