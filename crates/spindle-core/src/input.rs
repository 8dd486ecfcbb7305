//! Input batch: dense first-layer activations built from sparse triples.

use std::ops::Range;
use std::path::Path;

use crate::dtype::Element;
use crate::error::SpindleError;
use crate::format::{self, SparseEntry};
use crate::Result;

/// Dense `rows × neurons` activations plus per-row nonzero counts.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBatch<T> {
    rows: usize,
    neurons: usize,
    features: Vec<T>,
    row_len: Vec<i32>,
}

impl<T: Element> InputBatch<T> {
    /// Read a binary triple file holding a `rows × neurons` batch.
    pub fn load(path: &Path, rows: usize, neurons: usize) -> Result<Self> {
        let entries = format::read_entries::<T>(path)?;
        Self::build(&entries, rows, neurons, path)
    }

    /// Build from in-memory triples.
    pub fn from_entries(entries: &[SparseEntry<T>], rows: usize, neurons: usize) -> Result<Self> {
        Self::build(entries, rows, neurons, Path::new("<memory>"))
    }

    /// Build from an already dense matrix.
    pub fn from_dense(features: Vec<T>, rows: usize, neurons: usize) -> Result<Self> {
        if features.len() != rows * neurons {
            return Err(SpindleError::config(format!(
                "dense batch has {} values, expected {rows}x{neurons}",
                features.len()
            )));
        }
        let row_len = count_nonzeros(&features, rows, neurons);
        Ok(Self { rows, neurons, features, row_len })
    }

    fn build(entries: &[SparseEntry<T>], rows: usize, neurons: usize, path: &Path) -> Result<Self> {
        let mut features = vec![T::ZERO; rows * neurons];
        for (i, e) in entries.iter().enumerate() {
            if e.row < 0 || e.row as usize >= rows || e.col < 0 || e.col as usize >= neurons {
                return Err(SpindleError::malformed(
                    path,
                    format!("record {i}: ({}, {}) outside a {rows}x{neurons} batch", e.row, e.col),
                ));
            }
            // Duplicate coordinates overwrite.
            features[e.row as usize * neurons + e.col as usize] = e.value;
        }
        let row_len = count_nonzeros(&features, rows, neurons);
        tracing::debug!(
            "input batch: {} rows, {} nonzeros, {} non-empty rows",
            rows,
            entries.len(),
            row_len.iter().filter(|&&n| n > 0).count()
        );
        Ok(Self { rows, neurons, features, row_len })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn neurons(&self) -> usize {
        self.neurons
    }

    /// Row-major dense activations.
    pub fn features(&self) -> &[T] {
        &self.features
    }

    /// Nonzero count of every row.
    pub fn row_len(&self) -> &[i32] {
        &self.row_len
    }

    /// Dense activations of a contiguous row range.
    pub fn shard_features(&self, rows: Range<usize>) -> &[T] {
        &self.features[rows.start * self.neurons..rows.end * self.neurons]
    }

    /// Row lengths of a contiguous row range.
    pub fn shard_row_len(&self, rows: Range<usize>) -> &[i32] {
        &self.row_len[rows]
    }
}

/// Nonzero count of every `neurons`-wide row.
fn count_nonzeros<T: Element>(features: &[T], rows: usize, neurons: usize) -> Vec<i32> {
    if neurons == 0 {
        return vec![0; rows];
    }
    features.chunks(neurons).map(|row| row.iter().filter(|&&v| v != T::ZERO).count() as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_from_triples() {
        let entries = vec![
            SparseEntry::new(0, 1, 2.0f32),
            SparseEntry::new(2, 0, 1.0),
            SparseEntry::new(2, 3, 4.0),
        ];
        let batch = InputBatch::from_entries(&entries, 3, 4).unwrap();
        assert_eq!(batch.features()[1], 2.0);
        assert_eq!(batch.features()[2 * 4 + 3], 4.0);
        assert_eq!(batch.row_len(), &[1, 0, 2]);
        assert_eq!(batch.shard_features(2..3), &[1.0, 0.0, 0.0, 4.0]);
        assert_eq!(batch.shard_row_len(1..3), &[0, 2]);
    }

    #[test]
    fn test_duplicate_coordinates_last_value_wins() {
        let entries = vec![
            SparseEntry::new(0, 1, 2.0f32),
            SparseEntry::new(0, 1, 0.0),
            SparseEntry::new(1, 2, 0.0),
            SparseEntry::new(1, 2, 3.0),
            SparseEntry::new(1, 2, 5.0),
        ];
        let batch = InputBatch::from_entries(&entries, 2, 4).unwrap();
        assert_eq!(batch.features(), &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 0.0]);
        // Row 0 ends with no nonzero and is inactive at input.
        assert_eq!(batch.row_len(), &[0, 1]);
    }

    #[test]
    fn test_out_of_range_row() {
        let err = InputBatch::from_entries(&[SparseEntry::new(5, 0, 1.0f64)], 3, 4).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Io);
    }

    #[test]
    fn test_from_dense() {
        let batch = InputBatch::from_dense(vec![0.0f32, 1.0, 0.5, 0.0], 2, 2).unwrap();
        assert_eq!(batch.row_len(), &[1, 1]);
        assert!(InputBatch::from_dense(vec![0.0f32; 3], 2, 2).is_err());
    }

    #[test]
    fn test_load_binary() {
        let path = std::env::temp_dir().join(format!("spindle_input_{}.b", std::process::id()));
        format::write_entries(&path, &[SparseEntry::new(1, 1, 0.5f32)]).unwrap();
        let batch = InputBatch::<f32>::load(&path, 2, 2).unwrap();
        assert_eq!(batch.features(), &[0.0, 0.0, 0.0, 0.5]);
        let _ = std::fs::remove_file(&path);
    }
}
