//! # spindle-kernels
//!
//! Compute kernels of the spindle sparse inference engine.
//!
//! Provides:
//! - The sparse layer kernel over active rows (rayon, one task per row)
//! - Final class identification (argmax over positive activations)
//! - A dense reference forward pass for verification
//! - CUDA dispatch with NVRTC-compiled kernels (behind `cuda` feature flag)

pub mod sparse_layer;
pub mod identify;
pub mod reference;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use identify::identify;
pub use sparse_layer::{sparse_layer, Activation, LayerBuffers};
