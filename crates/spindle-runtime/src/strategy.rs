//! Execution strategies.
//!
//! A strategy decides how one device sequences a layer stage. The
//! orchestrator drives every device in lockstep: it issues a stage on all
//! devices before completing it on any, so the work of different devices
//! overlaps even though one thread controls them all.

use spindle_core::{Element, StrategyKind};

use crate::accelerator::Accelerator;
use crate::pipeline::DevicePipeline;
use crate::Result;

pub trait ExecutionStrategy<A: Accelerator, T: Element>: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Prepare a freshly loaded pipeline for layer 0.
    fn begin(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin) -> Result<()>;

    /// Enqueue the asynchronous part of stage `layer`.
    fn issue_stage(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin, layer: usize) -> Result<()>;

    /// Finish stage `layer`, leaving the active rows of the next one in place.
    fn complete_stage(&self, pipe: &mut DevicePipeline<A, T>, layer: usize) -> Result<()>;

    /// Called once after the last stage.
    fn finish(&self, _pipe: &mut DevicePipeline<A, T>) -> Result<()> {
        Ok(())
    }

    /// Run one whole stage on one device.
    fn run_stage(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin, layer: usize) -> Result<()> {
        self.issue_stage(pipe, pin, layer)?;
        self.complete_stage(pipe, layer)
    }
}

/// Blocking weight load before every kernel, no overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Baseline;

impl<A: Accelerator, T: Element> ExecutionStrategy<A, T> for Baseline {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Baseline
    }

    fn begin(&self, _pipe: &mut DevicePipeline<A, T>, _pin: &A::HostPin) -> Result<()> {
        Ok(())
    }

    fn issue_stage(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin, layer: usize) -> Result<()> {
        pipe.load_weights_blocking(pin, layer)?;
        pipe.compute_layer(layer)
    }

    fn complete_stage(&self, pipe: &mut DevicePipeline<A, T>, layer: usize) -> Result<()> {
        pipe.compact_rows_host(layer)?;
        pipe.reset_dead_buffers(layer)
    }
}

/// Weight prefetch on the transfer stream overlapped with compute.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pipelined;

impl<A: Accelerator, T: Element> ExecutionStrategy<A, T> for Pipelined {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pipelined
    }

    fn begin(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin) -> Result<()> {
        pipe.prime_weights(pin)
    }

    fn issue_stage(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin, layer: usize) -> Result<()> {
        pipe.prefetch_weights(pin, layer)?;
        pipe.compute_layer(layer)
    }

    fn complete_stage(&self, pipe: &mut DevicePipeline<A, T>, layer: usize) -> Result<()> {
        pipe.compact_rows_host(layer)?;
        pipe.reset_dead_buffers(layer)
    }
}

/// One captured graph per layer, replayed on every later run.
///
/// Compaction runs on the device, so stages never block the host; active
/// counts are collected once after the last layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskGraph;

impl<A: Accelerator, T: Element> ExecutionStrategy<A, T> for TaskGraph {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TaskGraph
    }

    fn begin(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin) -> Result<()> {
        pipe.prime_weights(pin)?;
        pipe.drain_transfers()
    }

    fn issue_stage(&self, pipe: &mut DevicePipeline<A, T>, pin: &A::HostPin, layer: usize) -> Result<()> {
        pipe.launch_layer_graph(pin, layer)
    }

    fn complete_stage(&self, _pipe: &mut DevicePipeline<A, T>, _layer: usize) -> Result<()> {
        Ok(())
    }

    fn finish(&self, pipe: &mut DevicePipeline<A, T>) -> Result<()> {
        pipe.collect_history()
    }
}

/// The strategy implementing `kind`.
pub fn strategy_for<A: Accelerator, T: Element>(kind: StrategyKind) -> Box<dyn ExecutionStrategy<A, T>> {
    match kind {
        StrategyKind::Baseline => Box::new(Baseline),
        StrategyKind::Pipelined => Box::new(Pipelined),
        StrategyKind::TaskGraph => Box::new(TaskGraph),
    }
}
