//! Sparse layer kernel.
//!
//! For every active row `r` and output neuron `n`:
//! `y[r][n] = clamp(Σ_k x[r][k] · W[k][n] + bias, 0, cap)`.
//!
//! Output neurons are processed one `COL_BLK`-wide slab at a time. Each slab
//! is accumulated in a per-row scratch tile, the host analogue of the shared
//! memory tile the CUDA kernel uses, then biased, clamped and written out.
//! The new row length counts the neurons whose biased value is positive.

use rayon::prelude::*;

use spindle_core::{Element, PackedWeightLayer};

/// Bias and upper clamp of the nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Activation<T> {
    pub bias: T,
    pub cap: T,
}

impl<T: Element> Activation<T> {
    pub fn new(bias: f64, cap: f64) -> Self {
        Self { bias: T::from_f64(bias), cap: T::from_f64(cap) }
    }

    /// Biased, clamped value and whether it counts toward the row length.
    #[inline]
    pub fn apply(&self, acc: T) -> (T, bool) {
        let v = acc + self.bias;
        if v > T::ZERO {
            (if v > self.cap { self.cap } else { v }, true)
        } else {
            (T::ZERO, false)
        }
    }
}

/// Feature and row-length buffers of one layer stage (full shard height).
pub struct LayerBuffers<'a, T> {
    pub features_in: &'a [T],
    /// Zeroed for every active row, leaving it clean for the stage after next.
    pub row_len_in: &'a mut [i32],
    pub features_out: &'a mut [T],
    pub row_len_out: &'a mut [i32],
}

/// Run one sparse layer over `active_rows`.
///
/// Work scales with the active rows only: each one is computed into a
/// compact staging buffer in parallel, then scattered to its shard row.
/// Rows not listed are left untouched in both output buffers.
pub fn sparse_layer<T: Element>(
    weights: &PackedWeightLayer<'_, T>,
    active_rows: &[i32],
    io: LayerBuffers<'_, T>,
    act: Activation<T>,
) {
    let LayerBuffers { features_in, row_len_in, features_out, row_len_out } = io;
    let neurons = weights.neurons;
    debug_assert_eq!(features_in.len(), row_len_out.len() * neurons);
    debug_assert_eq!(features_out.len(), row_len_out.len() * neurons);

    let mut staged = vec![T::ZERO; active_rows.len() * neurons];
    let mut lens = vec![0i32; active_rows.len()];
    staged
        .par_chunks_mut(neurons)
        .zip(lens.par_iter_mut())
        .zip(active_rows.par_iter())
        .for_each_init(
            || vec![T::ZERO; weights.col_blk],
            |tile, ((y, len), &r)| {
                let r = r as usize;
                *len = layer_row(weights, &features_in[r * neurons..(r + 1) * neurons], y, tile, act);
            },
        );

    for ((&r, y), &len) in active_rows.iter().zip(staged.chunks(neurons)).zip(&lens) {
        let r = r as usize;
        features_out[r * neurons..(r + 1) * neurons].copy_from_slice(y);
        row_len_out[r] = len;
        row_len_in[r] = 0;
    }
}

/// One row of the layer. Returns the row's new length.
fn layer_row<T: Element>(
    w: &PackedWeightLayer<'_, T>,
    x: &[T],
    y: &mut [T],
    tile: &mut [T],
    act: Activation<T>,
) -> i32 {
    let mut count = 0;
    for slab in 0..w.n_slab {
        let base = slab * w.col_blk;
        tile.fill(T::ZERO);
        for (k, &xk) in x.iter().enumerate() {
            if xk == T::ZERO {
                continue;
            }
            for e in w.bucket(slab, k) {
                tile[w.cols[e] as usize - base] += xk * w.vals[e];
            }
        }
        for (out, &acc) in y[base..base + w.col_blk].iter_mut().zip(tile.iter()) {
            let (v, positive) = act.apply(acc);
            *out = v;
            count += positive as i32;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::format::SparseEntry;
    use spindle_core::{Tiling, WeightStore};

    fn identity_store(n: usize, col_blk: usize) -> WeightStore<f32> {
        let entries: Vec<_> = (0..n as i32).map(|i| SparseEntry::new(i, i, 1.0)).collect();
        WeightStore::from_entries(&[entries], n, Tiling::with_col_blk(n, col_blk).unwrap()).unwrap()
    }

    #[test]
    fn test_identity_clips_inputs() {
        let store = identity_store(8, 8);
        let x = vec![
            0.5f32, 40.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
        ];
        let mut rlen_in = vec![2, 0];
        let mut y = vec![9.0f32; 16];
        let mut rlen_out = vec![-1, -1];
        sparse_layer(
            &store.layer(0),
            &[0],
            LayerBuffers {
                features_in: &x,
                row_len_in: &mut rlen_in,
                features_out: &mut y,
                row_len_out: &mut rlen_out,
            },
            Activation::new(0.0, 32.0),
        );
        assert_eq!(&y[..8], &[0.5, 32.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        // Inactive row untouched.
        assert!(y[8..].iter().all(|&v| v == 9.0));
        assert_eq!(rlen_out, vec![2, -1]);
        assert_eq!(rlen_in, vec![0, 0]);
    }

    #[test]
    fn test_bias_kills_small_values() {
        let store = identity_store(4, 2);
        let x = vec![0.2f32, 1.0, 0.0, 0.3];
        let mut rlen_in = vec![3];
        let mut y = vec![0.0f32; 4];
        let mut rlen_out = vec![0];
        sparse_layer(
            &store.layer(0),
            &[0],
            LayerBuffers {
                features_in: &x,
                row_len_in: &mut rlen_in,
                features_out: &mut y,
                row_len_out: &mut rlen_out,
            },
            Activation::new(-0.3, 32.0),
        );
        assert_eq!(rlen_out[0], 1);
        assert!((y[1] - 0.7).abs() < 1e-6);
        assert_eq!(y[0], 0.0);
        assert_eq!(y[3], 0.0);
    }

    #[test]
    fn test_only_listed_rows_are_computed() {
        let store = identity_store(4, 2);
        let x = vec![
            1.0f32, 0.0, 0.0, 0.0, //
            0.0, 2.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 3.0, //
        ];
        let mut rlen_in = vec![1, 1, 1];
        let mut y = vec![9.0f32; 12];
        let mut rlen_out = vec![-1, -1, -1];
        sparse_layer(
            &store.layer(0),
            &[2, 0],
            LayerBuffers {
                features_in: &x,
                row_len_in: &mut rlen_in,
                features_out: &mut y,
                row_len_out: &mut rlen_out,
            },
            Activation::new(0.0, 32.0),
        );
        assert_eq!(&y[..4], &[1.0, 0.0, 0.0, 0.0]);
        assert!(y[4..8].iter().all(|&v| v == 9.0));
        assert_eq!(&y[8..], &[0.0, 0.0, 0.0, 3.0]);
        assert_eq!(rlen_out, vec![1, -1, 1]);
        assert_eq!(rlen_in, vec![0, 1, 0]);
    }

    #[test]
    fn test_no_active_rows() {
        let store = identity_store(4, 4);
        let x = vec![1.0f32; 4];
        let mut rlen_in = vec![4];
        let mut y = vec![9.0f32; 4];
        let mut rlen_out = vec![-1];
        sparse_layer(
            &store.layer(0),
            &[],
            LayerBuffers {
                features_in: &x,
                row_len_in: &mut rlen_in,
                features_out: &mut y,
                row_len_out: &mut rlen_out,
            },
            Activation::new(0.0, 32.0),
        );
        assert_eq!(y, vec![9.0; 4]);
        assert_eq!((rlen_in, rlen_out), (vec![4], vec![-1]));
    }

    #[test]
    fn test_activation_apply() {
        let act = Activation::<f64>::new(-0.5, 4.0);
        assert_eq!(act.apply(0.5), (0.0, false));
        assert_eq!(act.apply(1.5), (1.0, true));
        assert_eq!(act.apply(10.0), (4.0, true));
    }
}
