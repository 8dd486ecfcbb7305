//! GPU integration tests for the CUDA accelerator.
//! Run with: cargo test -p spindle-runtime --features cuda -- --nocapture

#![cfg(feature = "cuda")]

use std::sync::Arc;

use spindle_core::format::SparseEntry;
use spindle_core::{EngineConfig, InputBatch, StrategyKind, Tiling, WeightStore, INACTIVE_CLASS};
use spindle_runtime::{Accelerator, CudaAccelerator, HostAccelerator, Orchestrator};

fn identity_network() -> (Arc<WeightStore<f32>>, InputBatch<f32>) {
    let layer: Vec<_> = (0..8).map(|i| SparseEntry::new(i, i, 1.0f32)).collect();
    let store = WeightStore::from_entries(&[layer.clone(), layer], 8, Tiling::with_col_blk(8, 8).unwrap()).unwrap();
    let batch = InputBatch::from_entries(
        &[
            SparseEntry::new(0, 2, 0.5f32),
            SparseEntry::new(0, 5, 3.0),
            SparseEntry::new(1, 1, 40.0),
            SparseEntry::new(3, 7, 0.25),
        ],
        4,
        8,
    )
    .unwrap();
    (Arc::new(store), batch)
}

#[test]
fn test_cuda_buffer_roundtrip() {
    let dev = CudaAccelerator::new(0).expect("no CUDA device");
    let s = dev.create_stream("compute").unwrap();
    let buf = dev.alloc_zeros::<i32>(4).unwrap();
    dev.upload(&s, &[1, 2, 3], &buf).unwrap();
    assert_eq!(dev.read(&s, &buf, 4).unwrap(), vec![1, 2, 3, 0]);
    dev.fill_zero_async(&s, &buf).unwrap();
    assert_eq!(dev.read(&s, &buf, 4).unwrap(), vec![0; 4]);
}

#[test]
fn test_cuda_matches_host() {
    let (store, batch) = identity_network();
    for kind in StrategyKind::ALL {
        let cfg = EngineConfig { strategy: kind, neurons: 8, layers: 2, batch_size: 4, bias: 0.0, ..Default::default() };
        let mut gpu = Orchestrator::new(cfg.clone(), Arc::clone(&store), CudaAccelerator::devices(1).unwrap()).unwrap();
        let mut host = Orchestrator::new(cfg, Arc::clone(&store), HostAccelerator::devices(1)).unwrap();
        let expected = host.infer(&batch).unwrap().classes;
        assert_eq!(expected, vec![5, 1, INACTIVE_CLASS, 7]);
        assert_eq!(gpu.infer(&batch).unwrap().classes, expected, "{kind}");
        // Second run replays captured graphs.
        assert_eq!(gpu.infer(&batch).unwrap().classes, expected, "{kind}");
    }
}
