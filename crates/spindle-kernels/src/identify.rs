//! Final class identification.

use rayon::prelude::*;

use spindle_core::{Element, INACTIVE_CLASS};

/// Index of the largest strictly positive value of `row`, first on ties.
pub fn identify_row<T: Element>(row: &[T]) -> i32 {
    let mut best = INACTIVE_CLASS;
    let mut best_val = T::ZERO;
    for (i, &v) in row.iter().enumerate() {
        if v > best_val {
            best = i as i32;
            best_val = v;
        }
    }
    best
}

/// Classify every row of a `results.len() × neurons` activation matrix.
pub fn identify<T: Element>(features: &[T], neurons: usize, results: &mut [i32]) {
    debug_assert_eq!(features.len(), results.len() * neurons);
    results
        .par_iter_mut()
        .zip(features.par_chunks(neurons))
        .for_each(|(out, row)| *out = identify_row(row));
}
