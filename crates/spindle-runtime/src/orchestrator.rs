//! Multi-device orchestrator.
//!
//! Splits the batch into contiguous shards, one per device, and drives
//! every device pipeline through the layers with the configured strategy.
//! Shard results are concatenated in shard order.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use spindle_core::{Element, EngineConfig, InputBatch, SpindleError, StrategyKind, WeightStore};

use crate::accelerator::{min_shared_mem, Accelerator};
use crate::pipeline::{DevicePipeline, PipelineStats};
use crate::strategy::{strategy_for, ExecutionStrategy};
use crate::Result;

/// Contiguous shards of `ceil(rows / devices)` rows. Empty trailing shards
/// are dropped, so fewer shards than devices may come back.
pub fn partition_rows(rows: usize, devices: usize) -> Vec<Range<usize>> {
    if devices == 0 {
        return Vec::new();
    }
    let chunk = rows.div_ceil(devices);
    let shards: Vec<_> = (0..devices)
        .map(|d| (d * chunk).min(rows)..((d + 1) * chunk).min(rows))
        .filter(|r| !r.is_empty())
        .collect();
    if shards.len() < devices {
        tracing::warn!(
            "{} rows leave {} of {} devices without work",
            rows,
            devices - shards.len(),
            devices
        );
    }
    shards
}

/// Fast memory the packed layout must fit: the override, or the smallest
/// capacity among the selected devices.
pub fn tiling_budget<A: Accelerator>(config: &EngineConfig, devices: &[A]) -> Result<usize> {
    let capacity = min_shared_mem(devices).ok_or_else(|| SpindleError::config("no devices selected"))?;
    Ok(config.shared_mem_bytes.map_or(capacity, |bytes| bytes.min(capacity)))
}

/// Per-device summary of one `infer` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub ordinal: usize,
    pub first_row: usize,
    pub rows: usize,
    /// Active count before layer 0 and after every layer.
    pub active_history: Vec<usize>,
    pub stats: PipelineStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceOutcome {
    /// Class of every batch row, `-1` for inactive rows.
    pub classes: Vec<i32>,
    pub devices: Vec<DeviceReport>,
}

pub struct Orchestrator<A: Accelerator, T: Element> {
    config: EngineConfig,
    store: Arc<WeightStore<T>>,
    strategy: Box<dyn ExecutionStrategy<A, T>>,
    pipelines: Vec<DevicePipeline<A, T>>,
    /// Outlives every pipeline copying from it.
    pin: A::HostPin,
}

impl<A: Accelerator, T: Element> Orchestrator<A, T> {
    /// Pin the weights and build one pipeline per non-empty shard.
    pub fn new(config: EngineConfig, store: Arc<WeightStore<T>>, devices: Vec<A>) -> Result<Self> {
        config.validate()?;
        if devices.len() != config.devices {
            return Err(SpindleError::config(format!(
                "{} devices configured, {} provided",
                config.devices,
                devices.len()
            )));
        }
        if T::PRECISION != config.precision {
            return Err(SpindleError::config(format!(
                "engine built for {} but configured for {}",
                T::PRECISION,
                config.precision
            )));
        }
        if store.neurons() != config.neurons || store.num_layers() != config.layers {
            return Err(SpindleError::config(format!(
                "weights hold {} layers of {} neurons, configured for {} layers of {}",
                store.num_layers(),
                store.neurons(),
                config.layers,
                config.neurons
            )));
        }
        let tile = store.tiling().tile_bytes(std::mem::size_of::<T>());
        let capacity = tiling_budget(&config, &devices)?;
        if tile > capacity {
            return Err(SpindleError::config(format!(
                "tile of {tile} bytes does not fit {capacity} bytes of fast memory"
            )));
        }

        let pin = devices[0].pin_host(store.region())?;
        let shards = partition_rows(config.batch_size, devices.len());
        let pipelines = devices
            .into_iter()
            .zip(shards)
            .map(|(accel, shard)| DevicePipeline::new(accel, shard, *store.layout(), &config))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "{} strategy on {} device(s), {} weight slots each",
            config.strategy,
            pipelines.len(),
            config.buffers_per_device
        );
        Ok(Self { strategy: strategy_for(config.strategy), config, store, pipelines, pin })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<WeightStore<T>> {
        &self.store
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn pipelines(&self) -> &[DevicePipeline<A, T>] {
        &self.pipelines
    }

    /// Run the network over `batch` and classify every row.
    pub fn infer(&mut self, batch: &InputBatch<T>) -> Result<InferenceOutcome> {
        if batch.rows() != self.config.batch_size || batch.neurons() != self.config.neurons {
            return Err(SpindleError::config(format!(
                "batch is {}x{}, configured for {}x{}",
                batch.rows(),
                batch.neurons(),
                self.config.batch_size,
                self.config.neurons
            )));
        }
        let start = Instant::now();

        for pipe in &mut self.pipelines {
            pipe.load_inputs(batch)?;
            self.strategy.begin(pipe, &self.pin)?;
        }
        for layer in 0..self.config.layers {
            for pipe in &mut self.pipelines {
                self.strategy.issue_stage(pipe, &self.pin, layer)?;
            }
            for pipe in &mut self.pipelines {
                self.strategy.complete_stage(pipe, layer)?;
            }
        }
        for pipe in &mut self.pipelines {
            self.strategy.finish(pipe)?;
        }

        let mut shards = Vec::with_capacity(self.pipelines.len());
        for pipe in &mut self.pipelines {
            shards.push(pipe.final_identify()?);
        }
        let classes = if shards.len() == 1 { shards.swap_remove(0) } else { shards.concat() };

        let devices = self
            .pipelines
            .iter()
            .map(|pipe| DeviceReport {
                ordinal: pipe.ordinal(),
                first_row: pipe.shard().start,
                rows: pipe.rows(),
                active_history: pipe.active_history().to_vec(),
                stats: pipe.stats(),
            })
            .collect();
        tracing::info!(
            "inferred {} rows through {} layers in {:.3}s",
            classes.len(),
            self.config.layers,
            start.elapsed().as_secs_f64()
        );
        Ok(InferenceOutcome { classes, devices })
    }
}
