//! Dense reference forward pass.
//!
//! Expands every packed layer to a dense matrix and multiplies row by row.
//! Quadratic in the neuron count, so meant for verification on small
//! networks. Rows whose input is all zero are inactive and stay zero, the
//! same way the sparse pipeline skips them.

use rayon::prelude::*;

use spindle_core::{Element, InputBatch, WeightStore};

use crate::identify::identify;
use crate::sparse_layer::Activation;

/// Final activations of every row after all layers.
pub fn forward_dense<T: Element>(
    store: &WeightStore<T>,
    batch: &InputBatch<T>,
    act: Activation<T>,
) -> Vec<T> {
    let neurons = store.neurons();
    let mut x = batch.features().to_vec();
    let mut y = vec![T::ZERO; x.len()];

    for layer in store.layers() {
        let w = layer.to_dense();
        y.par_chunks_mut(neurons).zip(x.par_chunks(neurons)).for_each(|(out, input)| {
            out.fill(T::ZERO);
            if input.iter().all(|&v| v == T::ZERO) {
                return;
            }
            for (k, &xk) in input.iter().enumerate() {
                if xk == T::ZERO {
                    continue;
                }
                for (o, &wk) in out.iter_mut().zip(&w[k * neurons..(k + 1) * neurons]) {
                    *o += xk * wk;
                }
            }
            for o in out.iter_mut() {
                *o = act.apply(*o).0;
            }
        });
        std::mem::swap(&mut x, &mut y);
    }
    x
}

/// Predicted class of every row.
pub fn classify_dense<T: Element>(
    store: &WeightStore<T>,
    batch: &InputBatch<T>,
    act: Activation<T>,
) -> Vec<i32> {
    let features = forward_dense(store, batch, act);
    let mut results = vec![0; batch.rows()];
    identify(&features, store.neurons(), &mut results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_layer::{sparse_layer, LayerBuffers};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use spindle_core::format::SparseEntry;
    use spindle_core::rows::compact_rows;
    use spindle_core::Tiling;

    fn assert_close(a: &[f64], b: &[f64], rel: f64) {
        assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            let tol = rel * x.abs().max(y.abs()).max(1.0);
            assert!((x - y).abs() <= tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
        }
    }

    fn random_layer(rng: &mut StdRng, neurons: usize, per_row: usize) -> Vec<SparseEntry<f64>> {
        let mut entries = Vec::new();
        for row in 0..neurons {
            for _ in 0..per_row {
                let col = rng.gen_range(0..neurons);
                entries.push(SparseEntry::new(row as i32, col as i32, rng.gen_range(-0.2..0.6)));
            }
        }
        entries
    }

    #[test]
    fn test_sparse_kernel_matches_dense_reference() {
        let mut rng = StdRng::seed_from_u64(7);
        let (rows, neurons, layers) = (24, 32, 4);
        let weights: Vec<_> = (0..layers).map(|_| random_layer(&mut rng, neurons, 4)).collect();
        let store = WeightStore::from_entries(&weights, neurons, Tiling::with_col_blk(neurons, 8).unwrap())
            .unwrap();

        let mut input = Vec::new();
        for row in 0..rows - 2 {
            for _ in 0..6 {
                input.push(SparseEntry::new(row as i32, rng.gen_range(0..neurons) as i32, 1.0));
            }
        }
        let batch = InputBatch::from_entries(&input, rows, neurons).unwrap();
        let act = Activation::new(-0.3, 32.0);

        let mut x = batch.features().to_vec();
        let mut y = vec![0.0f64; x.len()];
        let mut rlen = [batch.row_len().to_vec(), vec![0; rows]];
        let mut active = vec![0i32; rows];
        let mut count = compact_rows(&rlen[0], &mut active);
        for l in 0..layers {
            let (lo, hi) = rlen.split_at_mut(1);
            let (rin, rout) = if l % 2 == 0 { (&mut lo[0], &mut hi[0]) } else { (&mut hi[0], &mut lo[0]) };
            sparse_layer(
                &store.layer(l),
                &active[..count],
                LayerBuffers {
                    features_in: &x,
                    row_len_in: &mut rin[..],
                    features_out: &mut y,
                    row_len_out: &mut rout[..],
                },
                act,
            );
            count = compact_rows(&rout[..], &mut active);
            std::mem::swap(&mut x, &mut y);
            y.fill(0.0);
        }

        let dense = forward_dense(&store, &batch, act);
        assert_close(&x, &dense, 1e-3);

        let mut sparse_classes = vec![0; rows];
        identify(&x, neurons, &mut sparse_classes);
        assert_eq!(sparse_classes, classify_dense(&store, &batch, act));
        assert_eq!(&sparse_classes[rows - 2..], &[-1, -1]);
    }
}
