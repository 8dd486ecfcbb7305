//! # spindle-core
//!
//! Host-side building blocks of the spindle sparse inference engine.
//!
//! Provides:
//! - `Element`: the two supported numeric types (`f32`, `f64`)
//! - Tiling derivation (`COL_BLK` / `N_SLAB`) from accelerator fast-memory capacity
//! - The binary triple format, text conversion and golden labels
//! - `WeightStore`: every layer packed into one fixed-stride host region
//! - `InputBatch`: dense first-layer activations and row lengths
//! - Active-row compaction and tracking
//! - Engine configuration and golden scoring

pub mod dtype;
pub mod error;
pub mod config;
pub mod tiling;
pub mod format;
pub mod weights;
pub mod input;
pub mod rows;
pub mod score;

pub use dtype::{DeviceValue, Element, Precision};
pub use error::{DeviceError, ErrorCategory, SpindleError};
pub use config::{BackendKind, EngineConfig, StrategyKind, ThreadBlock};
pub use tiling::Tiling;
pub use weights::{HostRegion, PackedLayout, PackedWeightLayer, WeightStore};
pub use input::InputBatch;
pub use rows::{ActiveRowSet, RowTracker};
pub use score::ScoreReport;

pub type Result<T> = std::result::Result<T, SpindleError>;

/// Class reported for rows with no positive activation after the last layer.
pub const INACTIVE_CLASS: i32 = -1;
