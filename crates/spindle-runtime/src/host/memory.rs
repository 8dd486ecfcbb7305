//! Host-emulated device memory.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use spindle_core::{DeviceError, DeviceValue};

/// Bytes allocated against a device's capacity.
#[derive(Debug)]
pub(crate) struct MemoryLedger {
    device: usize,
    capacity: usize,
    used: Mutex<usize>,
}

impl MemoryLedger {
    pub(crate) fn new(device: usize, capacity: usize) -> Self {
        Self { device, capacity, used: Mutex::new(0) }
    }

    fn reserve(&self, bytes: usize) -> Result<(), DeviceError> {
        let mut used = self.used.lock();
        if *used + bytes > self.capacity {
            return Err(DeviceError::Alloc {
                device: self.device,
                bytes,
                msg: format!("out of memory ({} of {} bytes in use)", *used, self.capacity),
            });
        }
        *used += bytes;
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
    }

    pub(crate) fn used(&self) -> usize {
        *self.used.lock()
    }
}

/// Storage behind a [`HostBuffer`]. Releases its bytes on drop.
#[derive(Debug)]
pub(crate) struct HostMemory<E> {
    pub(crate) data: RwLock<Vec<E>>,
    bytes: usize,
    ledger: Arc<MemoryLedger>,
}

impl<E> Drop for HostMemory<E> {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

/// Device buffer of the host accelerator.
///
/// Cloning shares the allocation; queued work holds clones so memory stays
/// valid until the work has run.
#[derive(Debug)]
pub struct HostBuffer<E> {
    pub(crate) mem: Arc<HostMemory<E>>,
}

impl<E> Clone for HostBuffer<E> {
    fn clone(&self) -> Self {
        Self { mem: Arc::clone(&self.mem) }
    }
}

impl<E: DeviceValue> HostBuffer<E> {
    pub(crate) fn zeroed(ledger: &Arc<MemoryLedger>, len: usize) -> Result<Self, DeviceError> {
        let bytes = len * std::mem::size_of::<E>();
        ledger.reserve(bytes)?;
        Ok(Self {
            mem: Arc::new(HostMemory {
                data: RwLock::new(vec![bytemuck::Zeroable::zeroed(); len]),
                bytes,
                ledger: Arc::clone(ledger),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.mem.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the contents, bypassing stream order.
    pub fn snapshot(&self) -> Vec<E> {
        self.mem.data.read().clone()
    }
}
