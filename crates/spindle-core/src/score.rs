//! Scoring predicted classes against golden labels.

use std::fmt;

use serde::Serialize;

use crate::error::SpindleError;
use crate::{Result, INACTIVE_CLASS};

/// Outcome of comparing a result vector with golden labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreReport {
    pub total: usize,
    pub mismatches: usize,
    /// Rows predicted as inactive.
    pub inactive: usize,
    /// Up to the first few mismatching rows as `(row, predicted, golden)`.
    pub first_mismatches: Vec<(usize, i32, i32)>,
}

const MAX_REPORTED: usize = 8;

impl ScoreReport {
    /// Compare `predicted` with `golden` row by row.
    ///
    /// Lengths must agree; a length mismatch is a config error since it means
    /// the golden file belongs to a different batch.
    pub fn score(predicted: &[i32], golden: &[i32]) -> Result<Self> {
        if predicted.len() != golden.len() {
            return Err(SpindleError::config(format!(
                "golden file has {} labels for {} input rows",
                golden.len(),
                predicted.len()
            )));
        }
        let mut first_mismatches = Vec::new();
        let mut mismatches = 0;
        for (row, (&p, &g)) in predicted.iter().zip(golden).enumerate() {
            if p != g {
                mismatches += 1;
                if first_mismatches.len() < MAX_REPORTED {
                    first_mismatches.push((row, p, g));
                }
            }
        }
        Ok(Self {
            total: predicted.len(),
            mismatches,
            inactive: predicted.iter().filter(|&&p| p == INACTIVE_CLASS).count(),
            first_mismatches,
        })
    }

    pub fn is_match(&self) -> bool {
        self.mismatches == 0
    }

    /// Fraction of rows that agree with the golden labels.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.total - self.mismatches) as f64 / self.total as f64
        }
    }

    /// Advisory data error when any row disagrees.
    pub fn into_result(self) -> Result<Self> {
        if self.is_match() {
            Ok(self)
        } else {
            Err(SpindleError::Data { mismatches: self.mismatches, total: self.total })
        }
    }
}

impl fmt::Display for ScoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} rows match ({:.4}), {} inactive",
            self.total - self.mismatches,
            self.total,
            self.accuracy(),
            self.inactive
        )
    }
}
