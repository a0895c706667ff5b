//! Multiple-sequence alignment as per-site state indices.
//!
//! States are small non-negative integers. Any index at or beyond the
//! model's state count is treated as unknown (gap, `N`, ambiguity code).

use std::collections::HashMap;

use crate::error::{LikelihoodError, Result};

/// State index used for unknown/missing characters.
pub const UNKNOWN_STATE: u8 = u8::MAX;

/// Aligned sequences, one row per taxon.
#[derive(Clone, Debug)]
pub struct Alignment {
    labels: Vec<String>,
    sequences: Vec<Vec<u8>>,
    n_sites: usize,
    n_states: usize,
    label_to_idx: HashMap<String, usize>,
}

impl Alignment {
    /// Build from labels and state rows.
    ///
    /// # Arguments
    /// * `labels` - Taxon labels, unique
    /// * `sequences` - One row of state indices per label, all the same length
    /// * `n_states` - Size of the state alphabet
    pub fn new(labels: Vec<String>, sequences: Vec<Vec<u8>>, n_states: usize) -> Result<Self> {
        if labels.len() != sequences.len() {
            return Err(LikelihoodError::invalid_data(format!(
                "{} labels but {} sequences",
                labels.len(),
                sequences.len()
            )));
        }
        if labels.is_empty() {
            return Err(LikelihoodError::invalid_data("alignment has no sequences"));
        }
        if n_states < 2 {
            return Err(LikelihoodError::invalid_data(format!(
                "state alphabet must have at least 2 states, got {}",
                n_states
            )));
        }

        let n_sites = sequences[0].len();
        if n_sites == 0 {
            return Err(LikelihoodError::invalid_data("alignment has no sites"));
        }

        let mut label_to_idx = HashMap::with_capacity(labels.len());
        for (idx, (label, seq)) in labels.iter().zip(&sequences).enumerate() {
            if seq.len() != n_sites {
                return Err(LikelihoodError::invalid_data(format!(
                    "sequence '{}' has {} sites, expected {}",
                    label,
                    seq.len(),
                    n_sites
                )));
            }
            if label_to_idx.insert(label.clone(), idx).is_some() {
                return Err(LikelihoodError::invalid_data(format!(
                    "duplicate label '{}'",
                    label
                )));
            }
        }

        Ok(Self {
            labels,
            sequences,
            n_sites,
            n_states,
            label_to_idx,
        })
    }

    /// Build a 4-state alignment from nucleotide strings.
    ///
    /// `A`, `C`, `G`, `T` (and `U`) map to 0..4, case-insensitive; everything
    /// else becomes [`UNKNOWN_STATE`].
    pub fn from_nucleotides(rows: &[(&str, &str)]) -> Result<Self> {
        let labels = rows.iter().map(|(label, _)| label.to_string()).collect();
        let sequences = rows
            .iter()
            .map(|(_, seq)| seq.bytes().map(nucleotide_state).collect())
            .collect();
        Self::new(labels, sequences, 4)
    }

    #[inline]
    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    #[inline]
    pub fn n_sequences(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn sequence(&self, idx: usize) -> &[u8] {
        &self.sequences[idx]
    }

    /// Row for a label, if present.
    pub fn sequence_by_label(&self, label: &str) -> Option<&[u8]> {
        self.label_to_idx
            .get(label)
            .map(|&idx| self.sequences[idx].as_slice())
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.label_to_idx.get(label).copied()
    }

    /// Whether a state index denotes a known character.
    #[inline]
    pub fn is_known(&self, state: u8) -> bool {
        (state as usize) < self.n_states
    }
}

/// Map a nucleotide byte to its state index.
pub fn nucleotide_state(b: u8) -> u8 {
    match b {
        b'A' | b'a' => 0,
        b'C' | b'c' => 1,
        b'G' | b'g' => 2,
        b'T' | b't' | b'U' | b'u' => 3,
        _ => UNKNOWN_STATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_nucleotides() {
        let aln = Alignment::from_nucleotides(&[("A", "ACGT-"), ("B", "acgun")]).unwrap();
        assert_eq!(aln.n_sites(), 5);
        assert_eq!(aln.n_sequences(), 2);
        assert_eq!(aln.sequence(0), &[0, 1, 2, 3, UNKNOWN_STATE]);
        assert_eq!(aln.sequence_by_label("B").unwrap(), &[0, 1, 2, 3, UNKNOWN_STATE]);
        assert!(!aln.is_known(UNKNOWN_STATE));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = Alignment::from_nucleotides(&[("A", "ACGT"), ("B", "ACG")]);
        assert!(matches!(result, Err(LikelihoodError::InvalidData(_))));
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let result = Alignment::from_nucleotides(&[("A", "ACGT"), ("A", "ACGT")]);
        assert!(result.is_err());
    }
}
