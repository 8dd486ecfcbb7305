//! # spindle-runtime
//!
//! Multi-device execution of the spindle sparse network.
//!
//! Provides:
//! - `Accelerator`: the device seam (streams, events, buffers, kernels, graphs)
//! - `HostAccelerator`: a host-emulated device with real stream semantics
//! - `CudaAccelerator`: CUDA GPUs (behind `cuda` feature flag)
//! - `BufferRotation`: weight slots with event-ordered prefetch
//! - `DevicePipeline`: the per-device layer state machine
//! - Baseline, pipelined and task-graph execution strategies
//! - `Orchestrator`: batch sharding, lockstep stages and result merge

pub mod accelerator;
pub mod host;
pub mod rotation;
pub mod pipeline;
pub mod strategy;
pub mod orchestrator;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use accelerator::{Accelerator, DeviceProperties};
pub use host::HostAccelerator;
pub use orchestrator::{partition_rows, tiling_budget, DeviceReport, InferenceOutcome, Orchestrator};
pub use pipeline::{DevicePipeline, PipelineState, PipelineStats};
pub use rotation::{BufferRotation, RotationStats};
pub use strategy::{strategy_for, ExecutionStrategy};

#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;

pub type Result<T> = spindle_core::Result<T>;
