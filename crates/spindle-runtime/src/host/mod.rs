//! Host-emulated accelerator.
//!
//! Streams are worker threads, events are generation counters, device memory
//! is reference-counted host memory charged against a configurable capacity,
//! and kernels run on the rayon pool. Ordering between streams comes only
//! from events, the same contract a GPU gives, so every strategy exercises
//! its real synchronization on this backend.

mod event;
mod graph;
mod memory;
mod stream;

use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use spindle_core::rows::compact_rows;
use spindle_core::{DeviceError, DeviceValue, Element, HostRegion};
use spindle_kernels::{identify, sparse_layer, Activation, LayerBuffers};

use crate::accelerator::{Accelerator, CompactLaunch, DeviceProperties, SparseLayerLaunch};

pub use event::HostEvent;
pub use graph::HostGraph;
pub use memory::HostBuffer;
pub use stream::HostStream;

use graph::CaptureSession;
use memory::MemoryLedger;
use stream::{Command, Op};

/// Fast memory per block reported by default, matching common GPUs.
pub const DEFAULT_SHARED_MEM: usize = 48 * 1024;
pub const DEFAULT_MAX_THREADS: usize = 1024;
pub const DEFAULT_TOTAL_MEMORY: usize = 16 << 30;

/// Page-lock guard of the host accelerator; counts live pins.
pub struct HostPinGuard {
    region: Arc<HostRegion>,
    pinned: Arc<AtomicUsize>,
    device: usize,
}

impl Drop for HostPinGuard {
    fn drop(&mut self) {
        self.pinned.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!("device {}: unpinned {} bytes", self.device, self.region.len_bytes());
    }
}

pub struct HostAccelerator {
    props: DeviceProperties,
    ledger: Arc<MemoryLedger>,
    next_stream: AtomicU64,
    capture: Mutex<Option<CaptureSession>>,
    pinned: Arc<AtomicUsize>,
}

impl HostAccelerator {
    pub fn new(ordinal: usize) -> Self {
        Self::with_properties(DeviceProperties {
            name: format!("host-emulated:{ordinal}"),
            ordinal,
            shared_mem_per_block: DEFAULT_SHARED_MEM,
            max_threads_per_block: DEFAULT_MAX_THREADS,
            total_memory: DEFAULT_TOTAL_MEMORY,
        })
    }

    pub fn with_properties(props: DeviceProperties) -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new(props.ordinal, props.total_memory)),
            props,
            next_stream: AtomicU64::new(1),
            capture: Mutex::new(None),
            pinned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `count` emulated devices with ordinals `0..count`.
    pub fn devices(count: usize) -> Vec<Self> {
        (0..count).map(Self::new).collect()
    }

    /// Bytes currently allocated on this device.
    pub fn memory_in_use(&self) -> usize {
        self.ledger.used()
    }

    /// Live host pins created through this device.
    pub fn pinned_regions(&self) -> usize {
        self.pinned.load(Ordering::SeqCst)
    }

    fn enqueue(&self, stream: &HostStream, op: Op) -> Result<(), DeviceError> {
        if let Some(session) = self.capture.lock().as_mut() {
            if session.is_member(stream.id) {
                session.push(stream.id, op);
                return Ok(());
            }
        }
        stream.send(Command::Op(op))
    }

    fn launch_error(&self, kernel: &str, msg: impl Into<String>) -> DeviceError {
        DeviceError::Launch { device: self.props.ordinal, kernel: kernel.to_string(), msg: msg.into() }
    }

    fn copy_error(&self, msg: impl Into<String>) -> DeviceError {
        DeviceError::Copy { device: self.props.ordinal, msg: msg.into() }
    }
}

impl Accelerator for HostAccelerator {
    type Stream = HostStream;
    type Event = HostEvent;
    type Buffer<E: DeviceValue> = HostBuffer<E>;
    type Graph = HostGraph;
    type HostPin = HostPinGuard;

    fn ordinal(&self) -> usize {
        self.props.ordinal
    }

    fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    fn create_stream(&self, label: &str) -> Result<HostStream, DeviceError> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        HostStream::spawn(self.props.ordinal, id, label)
    }

    fn create_event(&self) -> Result<HostEvent, DeviceError> {
        Ok(HostEvent::new())
    }

    fn record_event(&self, event: &HostEvent, stream: &HostStream) -> Result<(), DeviceError> {
        if let Some(session) = self.capture.lock().as_mut() {
            if session.is_member(stream.id) {
                session.note_event(&event.state, stream.id);
                return Ok(());
            }
        }
        let gen = event.state.next_generation();
        stream.send(Command::Signal(Arc::clone(&event.state), gen))
    }

    fn wait_event(&self, stream: &HostStream, event: &HostEvent) -> Result<(), DeviceError> {
        if let Some(session) = self.capture.lock().as_mut() {
            match event.state.captured_by() {
                Some(source) if session.is_member(source) => {
                    session.wait(stream.id, source);
                    return Ok(());
                }
                // Work from before the capture has finished by the time the
                // graph is launched.
                _ if session.is_member(stream.id) => return Ok(()),
                _ => {}
            }
        }
        let gen = event.state.latest();
        if gen == 0 {
            return Ok(());
        }
        stream.send(Command::Wait(Arc::clone(&event.state), gen))
    }

    fn synchronize_event(&self, event: &HostEvent) -> Result<(), DeviceError> {
        event.state.wait_for(event.state.latest());
        Ok(())
    }

    fn synchronize(&self, stream: &HostStream) -> Result<(), DeviceError> {
        if let Some(session) = self.capture.lock().as_ref() {
            if session.is_member(stream.id) {
                return Err(DeviceError::Capture {
                    device: self.props.ordinal,
                    msg: format!("cannot synchronize stream '{}' while capturing", stream.label()),
                });
            }
        }
        stream.synchronize()
    }

    fn alloc_zeros<E: DeviceValue>(&self, len: usize) -> Result<HostBuffer<E>, DeviceError> {
        HostBuffer::zeroed(&self.ledger, len)
    }

    fn pin_host(&self, region: &Arc<HostRegion>) -> Result<HostPinGuard, DeviceError> {
        self.pinned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("device {}: pinned {} bytes of host weights", self.props.ordinal, region.len_bytes());
        Ok(HostPinGuard {
            region: Arc::clone(region),
            pinned: Arc::clone(&self.pinned),
            device: self.props.ordinal,
        })
    }

    fn copy_region_async(
        &self,
        stream: &HostStream,
        pin: &HostPinGuard,
        words: Range<usize>,
        dst: &HostBuffer<u64>,
    ) -> Result<(), DeviceError> {
        if words.end > pin.region.words().len() || words.start > words.end {
            return Err(self.copy_error(format!(
                "words {:?} outside a pinned region of {} words",
                words,
                pin.region.words().len()
            )));
        }
        let n = words.len();
        if n > dst.len() {
            return Err(self.copy_error(format!("{} words into a buffer of {}", n, dst.len())));
        }
        let region = Arc::clone(&pin.region);
        let dst = dst.clone();
        self.enqueue(
            stream,
            Arc::new(move || {
                dst.mem.data.write()[..n].copy_from_slice(&region.words()[words.clone()]);
                Ok(())
            }),
        )
    }

    fn upload<E: DeviceValue>(
        &self,
        stream: &HostStream,
        src: &[E],
        dst: &HostBuffer<E>,
    ) -> Result<(), DeviceError> {
        if src.len() > dst.len() {
            return Err(self.copy_error(format!("{} values into a buffer of {}", src.len(), dst.len())));
        }
        let data = src.to_vec();
        let dst = dst.clone();
        self.enqueue(
            stream,
            Arc::new(move || {
                dst.mem.data.write()[..data.len()].copy_from_slice(&data);
                Ok(())
            }),
        )
    }

    fn read<E: DeviceValue>(
        &self,
        stream: &HostStream,
        src: &HostBuffer<E>,
        len: usize,
    ) -> Result<Vec<E>, DeviceError> {
        self.synchronize(stream)?;
        let data = src.mem.data.read();
        if len > data.len() {
            return Err(self.copy_error(format!("read of {} values from a buffer of {}", len, data.len())));
        }
        Ok(data[..len].to_vec())
    }

    fn fill_zero_async<E: DeviceValue>(&self, stream: &HostStream, buf: &HostBuffer<E>) -> Result<(), DeviceError> {
        let buf = buf.clone();
        self.enqueue(
            stream,
            Arc::new(move || {
                buf.mem.data.write().fill(bytemuck::Zeroable::zeroed());
                Ok(())
            }),
        )
    }

    fn launch_sparse_layer<T: Element>(
        &self,
        stream: &HostStream,
        launch: &SparseLayerLaunch<'_, Self, T>,
    ) -> Result<(), DeviceError> {
        const KERNEL: &str = "sparse_layer";
        launch
            .block
            .validate(self.props.max_threads_per_block)
            .map_err(|e| self.launch_error(KERNEL, e.to_string()))?;
        let layout = launch.layout;
        let tile = layout.tiling.tile_bytes(std::mem::size_of::<T>());
        if tile > self.props.shared_mem_per_block {
            return Err(self.launch_error(
                KERNEL,
                format!("tile of {} bytes exceeds {} bytes of fast memory", tile, self.props.shared_mem_per_block),
            ));
        }
        let rows = launch.row_len_out.len();
        if launch.weights.len() < layout.stride_words()
            || launch.features_in.len() != rows * layout.neurons
            || launch.features_out.len() != rows * layout.neurons
            || launch.row_len_in.len() != rows
        {
            return Err(self.launch_error(KERNEL, "buffer sizes do not match the layer shape"));
        }

        let x = launch.features_in.clone();
        let active = launch.active_count.clone();
        let rows_in = launch.rows_in.clone();
        let rlen_in = launch.row_len_in.clone();
        let w = launch.weights.clone();
        let y = launch.features_out.clone();
        let rlen_out = launch.row_len_out.clone();
        let act = Activation::<T>::new(launch.bias, launch.cap);
        let grid = launch.grid_rows;
        let device = self.props.ordinal;

        self.enqueue(
            stream,
            Arc::new(move || {
                let count = active.mem.data.read().first().copied().unwrap_or(0).max(0) as usize;
                let count = count.min(grid);
                let rows_in = rows_in.mem.data.read();
                if count > rows_in.len() || rows_in[..count].iter().any(|&r| r < 0 || r as usize >= rows) {
                    return Err(DeviceError::Launch {
                        device,
                        kernel: KERNEL.to_string(),
                        msg: format!("active row list of {count} entries is out of range"),
                    });
                }
                let w = w.mem.data.read();
                let view = layout.view::<T>(&w[..layout.stride_words()]);
                let x = x.mem.data.read();
                let mut rlen_in = rlen_in.mem.data.write();
                let mut y = y.mem.data.write();
                let mut rlen_out = rlen_out.mem.data.write();
                sparse_layer(
                    &view,
                    &rows_in[..count],
                    LayerBuffers {
                        features_in: &x[..],
                        row_len_in: &mut rlen_in[..],
                        features_out: &mut y[..],
                        row_len_out: &mut rlen_out[..],
                    },
                    act,
                );
                Ok(())
            }),
        )
    }

    fn launch_compact(&self, stream: &HostStream, launch: &CompactLaunch<'_, Self>) -> Result<(), DeviceError> {
        let rows = launch.rows;
        let slot = launch.slot;
        if launch.row_len.len() < rows || launch.rows_out.len() < rows || slot >= launch.history.len() {
            return Err(self.launch_error("compact_rows", "buffer sizes do not match the shard"));
        }
        let row_len = launch.row_len.clone();
        let rows_out = launch.rows_out.clone();
        let active = launch.active_count.clone();
        let history = launch.history.clone();
        self.enqueue(
            stream,
            Arc::new(move || {
                let row_len = row_len.mem.data.read();
                let count = compact_rows(&row_len[..rows], &mut rows_out.mem.data.write()[..]);
                active.mem.data.write()[0] = count as i32;
                history.mem.data.write()[slot] = count as i32;
                Ok(())
            }),
        )
    }

    fn launch_identify<T: Element>(
        &self,
        stream: &HostStream,
        features: &HostBuffer<T>,
        rows: usize,
        neurons: usize,
        results: &HostBuffer<i32>,
    ) -> Result<(), DeviceError> {
        if features.len() < rows * neurons || results.len() < rows {
            return Err(self.launch_error("identify", "buffer sizes do not match the shard"));
        }
        let features = features.clone();
        let results = results.clone();
        self.enqueue(
            stream,
            Arc::new(move || {
                let x = features.mem.data.read();
                let mut out = results.mem.data.write();
                identify(&x[..rows * neurons], neurons, &mut out[..rows]);
                Ok(())
            }),
        )
    }

    fn begin_capture(&self, stream: &HostStream) -> Result<(), DeviceError> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            return Err(DeviceError::Capture {
                device: self.props.ordinal,
                msg: "a capture is already in progress".to_string(),
            });
        }
        *capture = Some(CaptureSession::new(stream.id));
        Ok(())
    }

    fn end_capture(&self, stream: &HostStream) -> Result<HostGraph, DeviceError> {
        let mut capture = self.capture.lock();
        match capture.take() {
            Some(session) if session.origin == stream.id => session.finish(self.props.ordinal),
            other => {
                *capture = other;
                Err(DeviceError::Capture {
                    device: self.props.ordinal,
                    msg: format!("stream '{}' is not the capture origin", stream.label()),
                })
            }
        }
    }

    fn launch_graph(&self, graph: &HostGraph, stream: &HostStream) -> Result<(), DeviceError> {
        self.enqueue(stream, graph.replay_op())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_read_roundtrip() {
        let dev = HostAccelerator::new(0);
        let s = dev.create_stream("compute").unwrap();
        let buf = dev.alloc_zeros::<i32>(6).unwrap();
        dev.upload(&s, &[4, 5, 6], &buf).unwrap();
        assert_eq!(dev.read(&s, &buf, 6).unwrap(), vec![4, 5, 6, 0, 0, 0]);
        dev.fill_zero_async(&s, &buf).unwrap();
        assert_eq!(dev.read(&s, &buf, 3).unwrap(), vec![0, 0, 0]);
        assert!(dev.upload(&s, &[0; 7], &buf).is_err());
    }

    #[test]
    fn test_event_orders_streams() {
        let dev = HostAccelerator::new(0);
        let transfer = dev.create_stream("transfer").unwrap();
        let compute = dev.create_stream("compute").unwrap();
        let ready = dev.create_event().unwrap();
        let src = dev.alloc_zeros::<i32>(1).unwrap();
        let dst = dev.alloc_zeros::<i32>(1).unwrap();

        dev.upload(&transfer, &[41], &src).unwrap();
        let (s, d) = (src.clone(), dst.clone());
        dev.enqueue(
            &transfer,
            Arc::new(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                s.mem.data.write()[0] += 1;
                Ok(())
            }),
        )
        .unwrap();
        dev.record_event(&ready, &transfer).unwrap();
        dev.wait_event(&compute, &ready).unwrap();
        dev.enqueue(
            &compute,
            Arc::new(move || {
                d.mem.data.write()[0] = src.mem.data.read()[0];
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(dev.read(&compute, &dst, 1).unwrap(), vec![42]);
        dev.synchronize_event(&ready).unwrap();
        assert!(ready.is_complete());
    }

    #[test]
    fn test_capture_fork_join_and_replay() {
        let dev = HostAccelerator::new(0);
        let compute = dev.create_stream("compute").unwrap();
        let transfer = dev.create_stream("transfer").unwrap();
        let fork = dev.create_event().unwrap();
        let join = dev.create_event().unwrap();
        let a = dev.alloc_zeros::<i32>(2).unwrap();

        dev.begin_capture(&compute).unwrap();
        dev.record_event(&fork, &compute).unwrap();
        dev.wait_event(&transfer, &fork).unwrap();
        dev.upload(&transfer, &[5], &a).unwrap();
        dev.record_event(&join, &transfer).unwrap();
        let inc = a.clone();
        dev.enqueue(
            &compute,
            Arc::new(move || {
                inc.mem.data.write()[1] += 1;
                Ok(())
            }),
        )
        .unwrap();
        assert!(dev.synchronize(&compute).is_err());
        dev.wait_event(&compute, &join).unwrap();
        let graph = dev.end_capture(&compute).unwrap();
        assert_eq!(graph.len(), 2);

        // Nothing ran during capture.
        assert_eq!(a.snapshot(), vec![0, 0]);
        dev.launch_graph(&graph, &compute).unwrap();
        dev.launch_graph(&graph, &compute).unwrap();
        assert_eq!(dev.read(&compute, &a, 2).unwrap(), vec![5, 2]);
    }

    #[test]
    fn test_unjoined_capture_fails() {
        let dev = HostAccelerator::new(1);
        let compute = dev.create_stream("compute").unwrap();
        let transfer = dev.create_stream("transfer").unwrap();
        let fork = dev.create_event().unwrap();
        let a = dev.alloc_zeros::<i32>(1).unwrap();

        dev.begin_capture(&compute).unwrap();
        dev.record_event(&fork, &compute).unwrap();
        dev.wait_event(&transfer, &fork).unwrap();
        dev.upload(&transfer, &[1], &a).unwrap();
        let err = dev.end_capture(&compute).unwrap_err();
        assert!(matches!(err, DeviceError::Capture { device: 1, .. }));
        // The device can capture again afterwards.
        dev.begin_capture(&compute).unwrap();
        assert!(dev.end_capture(&compute).unwrap().is_empty());
    }

    #[test]
    fn test_alloc_beyond_capacity() {
        let dev = HostAccelerator::with_properties(DeviceProperties {
            name: "tiny".into(),
            ordinal: 5,
            shared_mem_per_block: DEFAULT_SHARED_MEM,
            max_threads_per_block: DEFAULT_MAX_THREADS,
            total_memory: 1024,
        });
        let _a = dev.alloc_zeros::<f64>(100).unwrap();
        let err = dev.alloc_zeros::<f64>(100).unwrap_err();
        assert!(matches!(err, DeviceError::Alloc { device: 5, .. }));
        assert_eq!(dev.memory_in_use(), 800);
    }

    #[test]
    fn test_pin_guard_releases() {
        let dev = HostAccelerator::new(0);
        let store = spindle_core::WeightStore::<f32>::from_entries(
            &[vec![spindle_core::format::SparseEntry::new(0, 0, 1.0)]],
            4,
            spindle_core::Tiling::with_col_blk(4, 4).unwrap(),
        )
        .unwrap();
        {
            let _pin = dev.pin_host(store.region()).unwrap();
            assert_eq!(dev.pinned_regions(), 1);
        }
        assert_eq!(dev.pinned_regions(), 0);
    }
}
