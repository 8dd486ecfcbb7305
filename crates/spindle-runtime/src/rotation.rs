//! Weight slot rotation.
//!
//! Each device owns `M ≥ 2` weight slots; layer `L` lives in slot `L mod M`
//! and loads run `M − 1` layers ahead of compute.
//!
//! ```text
//! transfer: [wait free(s)] [copy L+M-1 → s] [record ready(s)]
//! compute:                 [wait ready(L mod M)] [kernel L] [record free(L mod M)]
//! ```
//!
//! A slot is overwritten only after the compute stream has released it, and
//! a kernel reads a slot only after its copy has completed. Both orderings
//! are device events; no host lock takes part.

use spindle_core::{DeviceError, PackedLayout};

use crate::accelerator::Accelerator;

struct WeightSlot<A: Accelerator> {
    buffer: A::Buffer<u64>,
    /// Recorded on the transfer stream after a copy into the slot.
    ready: A::Event,
    /// Recorded on the compute stream after the last kernel reading the slot.
    free: A::Event,
    layer: Option<usize>,
}

/// Counters of one rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RotationStats {
    /// Loads issued by `prime`.
    pub initial_loads: usize,
    /// Loads issued ahead of compute during stages.
    pub prefetches: usize,
    /// Loads done synchronously.
    pub blocking_loads: usize,
    /// Copies recorded into captured graphs.
    pub captured_copies: usize,
}

pub struct BufferRotation<A: Accelerator> {
    slots: Vec<WeightSlot<A>>,
    layout: PackedLayout,
    num_layers: usize,
    stats: RotationStats,
}

impl<A: Accelerator> BufferRotation<A> {
    pub fn new(accel: &A, slots: usize, layout: PackedLayout, num_layers: usize) -> Result<Self, DeviceError> {
        debug_assert!(slots >= 2);
        let slots = (0..slots)
            .map(|_| {
                Ok(WeightSlot {
                    buffer: accel.alloc_zeros::<u64>(layout.stride_words())?,
                    ready: accel.create_event()?,
                    free: accel.create_event()?,
                    layer: None,
                })
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;
        Ok(Self { slots, layout, num_layers, stats: RotationStats::default() })
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Layers loaded ahead of the one being computed.
    pub fn lookahead(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn slot_of(&self, layer: usize) -> usize {
        layer % self.slots.len()
    }

    pub fn stats(&self) -> RotationStats {
        self.stats
    }

    /// Layer whose load was last issued into `layer`'s slot.
    pub fn resident(&self, layer: usize) -> Option<usize> {
        self.slots[self.slot_of(layer)].layer
    }

    /// Buffer of `layer`'s slot, without any synchronization.
    pub fn slot_buffer(&self, layer: usize) -> &A::Buffer<u64> {
        &self.slots[self.slot_of(layer)].buffer
    }

    fn issue_load(&mut self, accel: &A, transfer: &A::Stream, pin: &A::HostPin, layer: usize) -> Result<(), DeviceError> {
        let words = self.layout.layer_words(layer);
        let idx = self.slot_of(layer);
        let slot = &mut self.slots[idx];
        accel.wait_event(transfer, &slot.free)?;
        accel.copy_region_async(transfer, pin, words, &slot.buffer)?;
        accel.record_event(&slot.ready, transfer)?;
        slot.layer = Some(layer);
        Ok(())
    }

    /// Issue the loads of layers `0 ..= M−2` before the first stage.
    pub fn prime(&mut self, accel: &A, transfer: &A::Stream, pin: &A::HostPin) -> Result<(), DeviceError> {
        let upto = self.lookahead().min(self.num_layers);
        for layer in 0..upto {
            self.issue_load(accel, transfer, pin, layer)?;
            self.stats.initial_loads += 1;
        }
        tracing::trace!("primed layers 0..{} into {} slots", upto, self.slots.len());
        Ok(())
    }

    /// During stage `layer`, issue the load of layer `layer + M − 1`.
    ///
    /// Returns the prefetched layer, or `None` past the last layer.
    pub fn prefetch_for(
        &mut self,
        accel: &A,
        transfer: &A::Stream,
        pin: &A::HostPin,
        layer: usize,
    ) -> Result<Option<usize>, DeviceError> {
        let next = layer + self.lookahead();
        if next >= self.num_layers {
            return Ok(None);
        }
        self.issue_load(accel, transfer, pin, next)?;
        self.stats.prefetches += 1;
        Ok(Some(next))
    }

    /// Order `compute` after the copy of `layer` and return its slot.
    pub fn bind(&self, accel: &A, compute: &A::Stream, layer: usize) -> Result<&A::Buffer<u64>, DeviceError> {
        let slot = &self.slots[self.slot_of(layer)];
        debug_assert_eq!(slot.layer, Some(layer), "layer {layer} was never loaded into its slot");
        accel.wait_event(compute, &slot.ready)?;
        Ok(&slot.buffer)
    }

    /// Mark `layer`'s slot reusable once the work enqueued on `compute` is done.
    pub fn release(&self, accel: &A, compute: &A::Stream, layer: usize) -> Result<(), DeviceError> {
        accel.record_event(&self.slots[self.slot_of(layer)].free, compute)
    }

    /// Load `layer` with no overlap: drain compute, copy, drain transfer.
    pub fn load_blocking(
        &mut self,
        accel: &A,
        compute: &A::Stream,
        transfer: &A::Stream,
        pin: &A::HostPin,
        layer: usize,
    ) -> Result<&A::Buffer<u64>, DeviceError> {
        accel.synchronize(compute)?;
        let words = self.layout.layer_words(layer);
        let idx = self.slot_of(layer);
        let slot = &mut self.slots[idx];
        accel.copy_region_async(transfer, pin, words, &slot.buffer)?;
        accel.synchronize(transfer)?;
        slot.layer = Some(layer);
        self.stats.blocking_loads += 1;
        Ok(&self.slots[idx].buffer)
    }

    /// Record, inside a capture on `transfer`, the copy of layer `layer + M − 1`.
    ///
    /// Ordering comes from the graph's fork/join edges, so no slot events
    /// are used. Returns the captured layer, or `None` past the last layer.
    pub fn capture_prefetch(
        &mut self,
        accel: &A,
        transfer: &A::Stream,
        pin: &A::HostPin,
        layer: usize,
    ) -> Result<Option<usize>, DeviceError> {
        let next = layer + self.lookahead();
        if next >= self.num_layers {
            return Ok(None);
        }
        let words = self.layout.layer_words(next);
        accel.copy_region_async(transfer, pin, words, self.slot_buffer(next))?;
        self.stats.captured_copies += 1;
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostAccelerator;
    use spindle_core::format::SparseEntry;
    use spindle_core::{Tiling, WeightStore};

    /// Layer `l` holds a single entry (0, 0) with value `l + 1`.
    fn store(layers: usize) -> WeightStore<f32> {
        let layers: Vec<_> = (0..layers).map(|l| vec![SparseEntry::new(0, 0, (l + 1) as f32)]).collect();
        WeightStore::from_entries(&layers, 4, Tiling::with_col_blk(4, 4).unwrap()).unwrap()
    }

    fn first_value(dev: &HostAccelerator, s: &<HostAccelerator as Accelerator>::Stream, buf: &<HostAccelerator as Accelerator>::Buffer<u64>, layout: &PackedLayout) -> f32 {
        let words = dev.read(s, buf, layout.stride_words()).unwrap();
        layout.view::<f32>(&words).vals[0]
    }

    #[test]
    fn test_double_buffer_schedule() {
        let store = store(4);
        let dev = HostAccelerator::new(0);
        let compute = dev.create_stream("compute").unwrap();
        let transfer = dev.create_stream("transfer").unwrap();
        let pin = dev.pin_host(store.region()).unwrap();
        let mut rot = BufferRotation::new(&dev, 2, *store.layout(), 4).unwrap();

        rot.prime(&dev, &transfer, &pin).unwrap();
        assert_eq!(rot.stats().initial_loads, 1);
        for layer in 0..4 {
            let next = rot.prefetch_for(&dev, &transfer, &pin, layer).unwrap();
            assert_eq!(next, if layer < 3 { Some(layer + 1) } else { None });
            let buf = rot.bind(&dev, &compute, layer).unwrap();
            assert_eq!(first_value(&dev, &compute, buf, store.layout()), (layer + 1) as f32);
            rot.release(&dev, &compute, layer).unwrap();
        }
        assert_eq!(rot.stats().prefetches, 3);
        assert_eq!(rot.slot_of(3), 1);
    }

    #[test]
    fn test_deeper_lookahead() {
        let store = store(5);
        let dev = HostAccelerator::new(0);
        let compute = dev.create_stream("compute").unwrap();
        let transfer = dev.create_stream("transfer").unwrap();
        let pin = dev.pin_host(store.region()).unwrap();
        let mut rot = BufferRotation::new(&dev, 3, *store.layout(), 5).unwrap();

        rot.prime(&dev, &transfer, &pin).unwrap();
        assert_eq!(rot.stats().initial_loads, 2);
        assert_eq!(rot.resident(1), Some(1));
        assert_eq!(rot.prefetch_for(&dev, &transfer, &pin, 0).unwrap(), Some(2));
        let buf = rot.bind(&dev, &compute, 0).unwrap();
        assert_eq!(first_value(&dev, &compute, buf, store.layout()), 1.0);
        rot.release(&dev, &compute, 0).unwrap();
        assert_eq!(rot.prefetch_for(&dev, &transfer, &pin, 1).unwrap(), Some(3));
        assert_eq!(rot.resident(3), Some(3));
        assert_eq!(rot.prefetch_for(&dev, &transfer, &pin, 3).unwrap(), None);
    }

    #[test]
    fn test_single_layer_never_prefetches() {
        let store = store(1);
        let dev = HostAccelerator::new(0);
        let transfer = dev.create_stream("transfer").unwrap();
        let pin = dev.pin_host(store.region()).unwrap();
        let mut rot = BufferRotation::new(&dev, 2, *store.layout(), 1).unwrap();
        rot.prime(&dev, &transfer, &pin).unwrap();
        assert_eq!(rot.prefetch_for(&dev, &transfer, &pin, 0).unwrap(), None);
        assert_eq!(rot.stats().prefetches, 0);
        assert_eq!(rot.stats().initial_loads, 1);
    }

    #[test]
    fn test_blocking_load() {
        let store = store(3);
        let dev = HostAccelerator::new(0);
        let compute = dev.create_stream("compute").unwrap();
        let transfer = dev.create_stream("transfer").unwrap();
        let pin = dev.pin_host(store.region()).unwrap();
        let mut rot = BufferRotation::new(&dev, 2, *store.layout(), 3).unwrap();
        let buf = rot.load_blocking(&dev, &compute, &transfer, &pin, 2).unwrap();
        assert_eq!(first_value(&dev, &compute, buf, store.layout()), 3.0);
        assert_eq!(rot.stats().blocking_loads, 1);
    }
}
