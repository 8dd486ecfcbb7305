//! Benchmark: host sparse layer kernel across network widths and tilings.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spindle_core::format::SparseEntry;
use spindle_core::rows::compact_rows;
use spindle_core::{InputBatch, Tiling, WeightStore};
use spindle_kernels::{sparse_layer, Activation, LayerBuffers};

const ROWS: usize = 2048;
const NNZ_PER_ROW: usize = 32;

fn random_network(rng: &mut StdRng, neurons: usize) -> Vec<SparseEntry<f32>> {
    (0..neurons)
        .flat_map(|row| (0..NNZ_PER_ROW).map(move |_| row))
        .map(|row| SparseEntry::new(row as i32, rng.gen_range(0..neurons) as i32, 0.0625))
        .collect()
}

fn bench_layer(store: &WeightStore<f32>, batch: &InputBatch<f32>, iters: usize) -> (f64, usize) {
    let mut row_len_in = batch.row_len().to_vec();
    let mut active = vec![0i32; ROWS];
    let count = compact_rows(&row_len_in, &mut active);
    let mut out = vec![0.0f32; batch.features().len()];
    let mut row_len_out = vec![0i32; ROWS];

    let start = Instant::now();
    for _ in 0..iters {
        row_len_in.copy_from_slice(batch.row_len());
        sparse_layer(
            &store.layer(0),
            &active[..count],
            LayerBuffers {
                features_in: batch.features(),
                row_len_in: &mut row_len_in,
                features_out: &mut out,
                row_len_out: &mut row_len_out,
            },
            Activation::new(-0.3, 32.0),
        );
    }
    (start.elapsed().as_secs_f64() / iters as f64, count)
}

fn main() {
    println!("=== Spindle Sparse Layer Benchmark ===");
    println!("rows={}, nnz/row={}, threads={}\n", ROWS, NNZ_PER_ROW, rayon::current_num_threads());
    println!("{:<10} {:>8} {:>8} {:>12} {:>14}", "Neurons", "COL_BLK", "N_SLAB", "Layer (ms)", "Rows/s");
    println!("{}", "-".repeat(56));

    let mut rng = StdRng::seed_from_u64(42);
    for &neurons in &[1024usize, 4096, 16384] {
        let layer = random_network(&mut rng, neurons);
        let input: Vec<_> = (0..ROWS)
            .flat_map(|row| (0..NNZ_PER_ROW).map(move |_| row))
            .map(|row| SparseEntry::new(row as i32, rng.gen_range(0..neurons) as i32, 1.0f32))
            .collect();
        let batch = InputBatch::from_entries(&input, ROWS, neurons).unwrap();

        for col_blk in [neurons, neurons / 4] {
            let tiling = Tiling::with_col_blk(neurons, col_blk).unwrap();
            let store = WeightStore::from_entries(std::slice::from_ref(&layer), neurons, tiling).unwrap();
            let iters = if neurons <= 1024 { 20 } else { 5 };
            let (secs, active) = bench_layer(&store, &batch, iters);
            println!(
                "{:<10} {:>8} {:>8} {:>10.3}ms {:>14.0}",
                neurons,
                tiling.col_blk,
                tiling.n_slab,
                secs * 1000.0,
                active as f64 / secs
            );
        }
    }
}
