//! CUDA backend for the spindle kernels.
//!
//! Provides:
//! - Device context management (lazy handle per GPU)
//! - NVRTC compilation with per-device module caching
//! - Stream-ordered dispatch of the sparse layer, compaction and identify kernels

pub mod context;
pub mod launch;
pub mod ops;

pub use context::{device_count, get_device, CudaError};
pub use ops::{LayerShape, SparseLayerArgs};
