//! The accelerator seam.
//!
//! Everything the pipelines need from a device: streams, events, buffers,
//! pinned host memory, the three kernels and graph capture. Work enqueued on
//! a stream runs in order; work on different streams is ordered only through
//! events. Calls returning `Result` report enqueue-time failures; failures
//! during execution surface at the next synchronization point.

use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;

use spindle_core::{DeviceError, DeviceValue, Element, HostRegion, PackedLayout, ThreadBlock};

/// Static properties of one accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub name: String,
    pub ordinal: usize,
    /// Fast on-chip memory per block, bounds the tile width.
    pub shared_mem_per_block: usize,
    pub max_threads_per_block: usize,
    /// Device memory available for allocations.
    pub total_memory: usize,
}

/// Buffers and parameters of one sparse layer launch.
pub struct SparseLayerLaunch<'a, A: Accelerator + ?Sized, T: DeviceValue> {
    pub features_in: &'a A::Buffer<T>,
    /// One-element buffer holding the active-row count.
    pub active_count: &'a A::Buffer<i32>,
    pub rows_in: &'a A::Buffer<i32>,
    pub row_len_in: &'a A::Buffer<i32>,
    pub weights: &'a A::Buffer<u64>,
    pub features_out: &'a A::Buffer<T>,
    pub row_len_out: &'a A::Buffer<i32>,
    pub layout: PackedLayout,
    pub bias: f64,
    pub cap: f64,
    /// Scheduling units to launch; rows past the active count are skipped.
    pub grid_rows: usize,
    pub block: ThreadBlock,
}

/// Buffers of one device-side row compaction.
pub struct CompactLaunch<'a, A: Accelerator + ?Sized> {
    pub row_len: &'a A::Buffer<i32>,
    pub rows: usize,
    pub rows_out: &'a A::Buffer<i32>,
    pub active_count: &'a A::Buffer<i32>,
    /// Per-layer active counts; the new count goes to `history[slot]`.
    pub history: &'a A::Buffer<i32>,
    pub slot: usize,
}

pub trait Accelerator: Send + Sync {
    type Stream: Send;
    type Event: Send;
    type Buffer<E: DeviceValue>: Send;
    type Graph: Send;
    /// Scoped page-lock of a host region; released on drop.
    type HostPin: Send;

    fn ordinal(&self) -> usize;

    fn properties(&self) -> &DeviceProperties;

    fn create_stream(&self, label: &str) -> Result<Self::Stream, DeviceError>;

    fn create_event(&self) -> Result<Self::Event, DeviceError>;

    /// Mark the point after all work currently enqueued on `stream`.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<(), DeviceError>;

    /// Make later work on `stream` wait for the event's latest recording.
    /// Waiting on an event that was never recorded is a no-op.
    fn wait_event(&self, stream: &Self::Stream, event: &Self::Event) -> Result<(), DeviceError>;

    /// Block the calling thread until the event's latest recording completes.
    fn synchronize_event(&self, event: &Self::Event) -> Result<(), DeviceError>;

    /// Block until all work on `stream` completes, reporting its first failure.
    fn synchronize(&self, stream: &Self::Stream) -> Result<(), DeviceError>;

    fn alloc_zeros<E: DeviceValue>(&self, len: usize) -> Result<Self::Buffer<E>, DeviceError>;

    fn pin_host(&self, region: &Arc<HostRegion>) -> Result<Self::HostPin, DeviceError>;

    /// Copy `words` of a pinned region into the front of `dst`.
    fn copy_region_async(
        &self,
        stream: &Self::Stream,
        pin: &Self::HostPin,
        words: Range<usize>,
        dst: &Self::Buffer<u64>,
    ) -> Result<(), DeviceError>;

    /// Copy `src` into the front of `dst`. `src` may be reused on return.
    fn upload<E: DeviceValue>(
        &self,
        stream: &Self::Stream,
        src: &[E],
        dst: &Self::Buffer<E>,
    ) -> Result<(), DeviceError>;

    /// Synchronize `stream`, then read the first `len` values of `src`.
    fn read<E: DeviceValue>(
        &self,
        stream: &Self::Stream,
        src: &Self::Buffer<E>,
        len: usize,
    ) -> Result<Vec<E>, DeviceError>;

    fn fill_zero_async<E: DeviceValue>(
        &self,
        stream: &Self::Stream,
        buf: &Self::Buffer<E>,
    ) -> Result<(), DeviceError>;

    fn launch_sparse_layer<T: Element>(
        &self,
        stream: &Self::Stream,
        launch: &SparseLayerLaunch<'_, Self, T>,
    ) -> Result<(), DeviceError>;

    fn launch_compact(
        &self,
        stream: &Self::Stream,
        launch: &CompactLaunch<'_, Self>,
    ) -> Result<(), DeviceError>;

    fn launch_identify<T: Element>(
        &self,
        stream: &Self::Stream,
        features: &Self::Buffer<T>,
        rows: usize,
        neurons: usize,
        results: &Self::Buffer<i32>,
    ) -> Result<(), DeviceError>;

    /// Start recording work enqueued on `stream` (and on streams that join
    /// it through events) instead of executing it.
    fn begin_capture(&self, stream: &Self::Stream) -> Result<(), DeviceError>;

    /// Stop recording and instantiate the captured work as a graph.
    fn end_capture(&self, stream: &Self::Stream) -> Result<Self::Graph, DeviceError>;

    /// Enqueue one replay of `graph` on `stream`.
    fn launch_graph(&self, graph: &Self::Graph, stream: &Self::Stream) -> Result<(), DeviceError>;
}

/// Tile width must fit the smallest fast memory among `devices`.
pub fn min_shared_mem<A: Accelerator>(devices: &[A]) -> Option<usize> {
    devices.iter().map(|d| d.properties().shared_mem_per_block).min()
}
