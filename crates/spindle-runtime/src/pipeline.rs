//! Per-device pipeline.
//!
//! One pipeline owns a contiguous shard of the batch on one accelerator:
//! two streams, ping-pong feature and row-length buffers, the active-row
//! list, the weight slot rotation and the captured per-layer graphs.
//!
//! ```text
//! INIT → LOADED → { COMPUTING(L) → COMPACTED(L) } × layers → IDENTIFYING → DONE
//! ```
//!
//! Layer `L` reads `features[L mod 2]` and writes `features[(L+1) mod 2]`,
//! so the final activations live in `features[layers mod 2]`. After a
//! layer's kernel the input buffer is zeroed so rows that died leave no
//! stale values behind for the layer after next.

use std::fmt;
use std::ops::Range;

use serde::Serialize;

use spindle_core::{
    DeviceError, EngineConfig, Element, InputBatch, PackedLayout, RowTracker, SpindleError, ThreadBlock,
};

use crate::accelerator::{Accelerator, CompactLaunch, SparseLayerLaunch};
use crate::rotation::{BufferRotation, RotationStats};
use crate::Result;

/// Where a device pipeline is within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PipelineState {
    Init,
    /// Inputs resident, active rows initialized.
    Loaded,
    /// Kernel of `layer` enqueued.
    Computing { layer: usize },
    /// Active rows for the layer after `layer` are known.
    Compacted { layer: usize },
    Identifying,
    Done,
}

impl PipelineState {
    fn allows(&self, next: &PipelineState, num_layers: usize) -> bool {
        use PipelineState::*;
        match (*self, *next) {
            // A new batch may start from any state.
            (_, Loaded) => true,
            (Loaded, Computing { layer }) => layer == 0,
            (Compacted { layer: done }, Computing { layer }) => layer == done + 1 && layer < num_layers,
            (Computing { layer: a }, Compacted { layer: b }) => a == b,
            (Compacted { layer }, Identifying) => layer + 1 == num_layers,
            (Identifying, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Init => write!(f, "init"),
            PipelineState::Loaded => write!(f, "loaded"),
            PipelineState::Computing { layer } => write!(f, "computing({layer})"),
            PipelineState::Compacted { layer } => write!(f, "compacted({layer})"),
            PipelineState::Identifying => write!(f, "identifying"),
            PipelineState::Done => write!(f, "done"),
        }
    }
}

/// Work counters of one pipeline, accumulated over every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub runs: usize,
    pub kernel_launches: usize,
    pub host_compactions: usize,
    pub graphs_captured: usize,
    pub graph_launches: usize,
    pub rotation: RotationStats,
}

pub struct DevicePipeline<A: Accelerator, T: Element> {
    shard: Range<usize>,
    layout: PackedLayout,
    num_layers: usize,
    bias: f64,
    cap: f64,
    block: ThreadBlock,

    features: [A::Buffer<T>; 2],
    row_len: [A::Buffer<i32>; 2],
    active_rows: A::Buffer<i32>,
    active_count: A::Buffer<i32>,
    /// Active count before layer 0 and after every layer (graph runs).
    history: A::Buffer<i32>,
    results: A::Buffer<i32>,
    rotation: BufferRotation<A>,
    graphs: Vec<A::Graph>,
    fork: A::Event,
    join: A::Event,

    tracker: RowTracker,
    state: PipelineState,
    stats: PipelineStats,

    compute: A::Stream,
    transfer: A::Stream,
    accel: A,
}

impl<A: Accelerator, T: Element> Drop for DevicePipeline<A, T> {
    fn drop(&mut self) {
        // Buffers are freed below; nothing in flight may still touch them.
        let _ = self.accel.synchronize(&self.transfer);
        let _ = self.accel.synchronize(&self.compute);
    }
}

impl<A: Accelerator, T: Element> DevicePipeline<A, T> {
    /// Allocate every device resource of a shard.
    pub fn new(accel: A, shard: Range<usize>, layout: PackedLayout, config: &EngineConfig) -> Result<Self> {
        let ordinal = accel.ordinal();
        let props = accel.properties();
        config
            .thread_block
            .validate(props.max_threads_per_block)
            .map_err(|e| SpindleError::config(format!("device {ordinal}: {e}")))?;
        let tile = layout.tiling.tile_bytes(std::mem::size_of::<T>());
        if tile > props.shared_mem_per_block {
            return Err(SpindleError::config(format!(
                "device {ordinal}: tile of {tile} bytes exceeds {} bytes of fast memory",
                props.shared_mem_per_block
            )));
        }

        let rows = shard.len();
        let neurons = layout.neurons;
        let num_layers = config.layers;
        let compute = accel.create_stream("compute")?;
        let transfer = accel.create_stream("transfer")?;
        let features = [accel.alloc_zeros::<T>(rows * neurons)?, accel.alloc_zeros::<T>(rows * neurons)?];
        let row_len = [accel.alloc_zeros::<i32>(rows)?, accel.alloc_zeros::<i32>(rows)?];
        let active_rows = accel.alloc_zeros::<i32>(rows)?;
        let active_count = accel.alloc_zeros::<i32>(1)?;
        let history = accel.alloc_zeros::<i32>(num_layers + 1)?;
        let results = accel.alloc_zeros::<i32>(rows)?;
        let rotation = BufferRotation::new(&accel, config.buffers_per_device, layout, num_layers)?;
        let fork = accel.create_event()?;
        let join = accel.create_event()?;

        tracing::debug!(
            "device {}: pipeline for rows {:?}, {} weight slots of {} bytes",
            ordinal,
            shard,
            config.buffers_per_device,
            layout.stride_bytes()
        );

        Ok(Self {
            shard,
            layout,
            num_layers,
            bias: config.bias,
            cap: config.activation_cap,
            block: config.thread_block,
            features,
            row_len,
            active_rows,
            active_count,
            history,
            results,
            rotation,
            graphs: Vec::new(),
            fork,
            join,
            tracker: RowTracker::new(rows),
            state: PipelineState::Init,
            stats: PipelineStats::default(),
            compute,
            transfer,
            accel,
        })
    }

    pub fn ordinal(&self) -> usize {
        self.accel.ordinal()
    }

    pub fn accelerator(&self) -> &A {
        &self.accel
    }

    /// Batch rows owned by this pipeline.
    pub fn shard(&self) -> Range<usize> {
        self.shard.clone()
    }

    pub fn rows(&self) -> usize {
        self.shard.len()
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats { rotation: self.rotation.stats(), ..self.stats }
    }

    /// Active count before layer 0 followed by the count after every layer.
    pub fn active_history(&self) -> &[usize] {
        self.tracker.history()
    }

    pub fn graphs_built(&self) -> usize {
        self.graphs.len()
    }

    fn transition(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.allows(&next, self.num_layers) {
            return Err(SpindleError::config(format!(
                "device {}: invalid pipeline transition {} -> {}",
                self.ordinal(),
                self.state,
                next
            )));
        }
        tracing::trace!("device {}: {} -> {}", self.ordinal(), self.state, next);
        self.state = next;
        Ok(())
    }

    /// Upload the shard's inputs and derive the initial active rows.
    pub fn load_inputs(&mut self, batch: &InputBatch<T>) -> Result<()> {
        self.transition(PipelineState::Loaded)?;
        let (accel, s) = (&self.accel, &self.compute);
        let row_len = batch.shard_row_len(self.shard.clone());
        accel.upload(s, batch.shard_features(self.shard.clone()), &self.features[0])?;
        accel.fill_zero_async(s, &self.features[1])?;
        accel.upload(s, row_len, &self.row_len[0])?;
        accel.fill_zero_async(s, &self.row_len[1])?;

        let count = self.tracker.reset(row_len);
        accel.upload(s, self.tracker.current().rows(), &self.active_rows)?;
        accel.upload(s, &[count as i32], &self.active_count)?;
        accel.fill_zero_async(s, &self.history)?;
        accel.upload(s, &[count as i32], &self.history)?;
        self.stats.runs += 1;
        tracing::debug!("device {}: {} of {} rows active at input", self.ordinal(), count, self.rows());
        Ok(())
    }

    /// Issue the initial weight loads of the rotation.
    pub fn prime_weights(&mut self, pin: &A::HostPin) -> Result<()> {
        self.rotation.prime(&self.accel, &self.transfer, pin)?;
        Ok(())
    }

    /// Issue the load `rotation.lookahead()` layers ahead of `layer`.
    pub fn prefetch_weights(&mut self, pin: &A::HostPin, layer: usize) -> Result<Option<usize>> {
        let next = self.rotation.prefetch_for(&self.accel, &self.transfer, pin, layer)?;
        if let Some(next) = next {
            tracing::trace!("device {}: prefetching layer {} during layer {}", self.ordinal(), next, layer);
        }
        Ok(next)
    }

    /// Load `layer` with no overlap.
    pub fn load_weights_blocking(&mut self, pin: &A::HostPin, layer: usize) -> Result<()> {
        self.rotation.load_blocking(&self.accel, &self.compute, &self.transfer, pin, layer)?;
        Ok(())
    }

    /// Block until every issued weight load has completed.
    pub fn drain_transfers(&self) -> Result<()> {
        self.accel.synchronize(&self.transfer)?;
        Ok(())
    }

    fn layer_launch<'a>(&'a self, layer: usize, weights: &'a A::Buffer<u64>, grid_rows: usize) -> SparseLayerLaunch<'a, A, T> {
        let (cur, next) = (layer % 2, (layer + 1) % 2);
        SparseLayerLaunch {
            features_in: &self.features[cur],
            active_count: &self.active_count,
            rows_in: &self.active_rows,
            row_len_in: &self.row_len[cur],
            weights,
            features_out: &self.features[next],
            row_len_out: &self.row_len[next],
            layout: self.layout,
            bias: self.bias,
            cap: self.cap,
            grid_rows,
            block: self.block,
        }
    }

    /// Enqueue the sparse kernel of `layer` after its weights are ready, then
    /// release the weight slot.
    pub fn compute_layer(&mut self, layer: usize) -> Result<()> {
        self.transition(PipelineState::Computing { layer })?;
        let grid = self.tracker.current().len();
        let weights = self.rotation.bind(&self.accel, &self.compute, layer)?;
        self.accel.launch_sparse_layer(&self.compute, &self.layer_launch(layer, weights, grid))?;
        self.rotation.release(&self.accel, &self.compute, layer)?;
        self.stats.kernel_launches += 1;
        Ok(())
    }

    /// Wait for `layer`'s kernel, then compact its output row lengths on the host.
    ///
    /// The read synchronizes the compute stream; this is the one blocking
    /// point of every pipelined stage.
    pub fn compact_rows_host(&mut self, layer: usize) -> Result<usize> {
        self.transition(PipelineState::Compacted { layer })?;
        let row_len = self.accel.read(&self.compute, &self.row_len[(layer + 1) % 2], self.rows())?;
        let count = self.tracker.advance(&row_len);
        self.accel.upload(&self.compute, self.tracker.current().rows(), &self.active_rows)?;
        self.accel.upload(&self.compute, &[count as i32], &self.active_count)?;
        self.stats.host_compactions += 1;
        tracing::debug!("device {}: layer {} left {} active rows", self.ordinal(), layer, count);
        Ok(count)
    }

    fn compact_rows_device(&self, layer: usize) -> std::result::Result<(), DeviceError> {
        self.accel.launch_compact(
            &self.compute,
            &CompactLaunch {
                row_len: &self.row_len[(layer + 1) % 2],
                rows: self.rows(),
                rows_out: &self.active_rows,
                active_count: &self.active_count,
                history: &self.history,
                slot: layer + 1,
            },
        )
    }

    /// Zero `layer`'s input features once its kernel has consumed them.
    pub fn reset_dead_buffers(&self, layer: usize) -> Result<()> {
        self.accel.fill_zero_async(&self.compute, &self.features[layer % 2])?;
        Ok(())
    }

    fn capture_body(&mut self, pin: &A::HostPin, layer: usize) -> std::result::Result<(), DeviceError> {
        self.accel.record_event(&self.fork, &self.compute)?;
        self.accel.wait_event(&self.transfer, &self.fork)?;
        self.rotation.capture_prefetch(&self.accel, &self.transfer, pin, layer)?;
        self.accel.record_event(&self.join, &self.transfer)?;

        // Every row gets a scheduling unit; the kernel reads the live count.
        let weights = self.rotation.slot_buffer(layer);
        self.accel.launch_sparse_layer(&self.compute, &self.layer_launch(layer, weights, self.rows()))?;
        self.compact_rows_device(layer)?;
        self.accel.fill_zero_async(&self.compute, &self.features[layer % 2])?;
        self.accel.wait_event(&self.compute, &self.join)?;
        Ok(())
    }

    /// Capture the graph of `layer`:
    /// fork → (weight prefetch ∥ kernel → device compaction → reset) → join.
    fn capture_layer(&mut self, pin: &A::HostPin, layer: usize) -> std::result::Result<A::Graph, DeviceError> {
        self.accel.begin_capture(&self.compute)?;
        match self.capture_body(pin, layer) {
            Ok(()) => self.accel.end_capture(&self.compute),
            Err(err) => {
                // The partial graph is discarded.
                let _ = self.accel.end_capture(&self.compute);
                Err(err)
            }
        }
    }

    /// Launch `layer`'s graph, capturing it on first use.
    pub fn launch_layer_graph(&mut self, pin: &A::HostPin, layer: usize) -> Result<()> {
        self.transition(PipelineState::Computing { layer })?;
        if self.graphs.len() == layer {
            let graph = self.capture_layer(pin, layer)?;
            self.graphs.push(graph);
            self.stats.graphs_captured += 1;
            tracing::debug!("device {}: captured graph for layer {}", self.ordinal(), layer);
        }
        self.accel.launch_graph(&self.graphs[layer], &self.compute)?;
        self.stats.graph_launches += 1;
        self.transition(PipelineState::Compacted { layer })
    }

    /// Collect the active counts the graphs left in device memory.
    pub fn collect_history(&mut self) -> Result<()> {
        let history = self.accel.read(&self.compute, &self.history, self.num_layers + 1)?;
        self.tracker.set_history(history.into_iter().map(|c| c.max(0) as usize).collect());
        if !self.tracker.is_non_increasing() {
            tracing::warn!("device {}: active row counts grew: {:?}", self.ordinal(), self.tracker.history());
        }
        Ok(())
    }

    /// Classify every shard row from the final activations.
    pub fn final_identify(&mut self) -> Result<Vec<i32>> {
        self.transition(PipelineState::Identifying)?;
        let rows = self.rows();
        let features = &self.features[self.num_layers % 2];
        self.accel.launch_identify(&self.compute, features, rows, self.layout.neurons, &self.results)?;
        let classes = self.accel.read(&self.compute, &self.results, rows)?;
        self.transition(PipelineState::Done)?;
        Ok(classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Init.allows(&Loaded, 2));
        assert!(!Init.allows(&Computing { layer: 0 }, 2));
        assert!(Loaded.allows(&Computing { layer: 0 }, 2));
        assert!(!Loaded.allows(&Computing { layer: 1 }, 2));
        assert!(Computing { layer: 0 }.allows(&Compacted { layer: 0 }, 2));
        assert!(!Computing { layer: 0 }.allows(&Compacted { layer: 1 }, 2));
        assert!(Compacted { layer: 0 }.allows(&Computing { layer: 1 }, 2));
        assert!(!Compacted { layer: 1 }.allows(&Computing { layer: 2 }, 2));
        assert!(!Compacted { layer: 0 }.allows(&Identifying, 2));
        assert!(Compacted { layer: 1 }.allows(&Identifying, 2));
        assert!(Identifying.allows(&Done, 2));
        assert!(Done.allows(&Loaded, 2));
        assert!(!Done.allows(&Identifying, 2));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Computing { layer: 3 }.to_string(), "computing(3)");
        assert_eq!(PipelineState::Done.to_string(), "done");
    }
}
