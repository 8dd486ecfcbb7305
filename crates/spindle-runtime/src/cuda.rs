//! CUDA accelerator.
//!
//! Streams are non-blocking streams forked from the device, events disable
//! timing, graphs come from stream capture, and the host weight region is
//! page-locked with `cuMemHostRegister` so layer copies run asynchronously.

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use cudarc::driver::sys::{self, CUdevice_attribute};
use cudarc::driver::{result, CudaDevice, CudaSlice, CudaStream, DevicePtr, DriverError};

use spindle_core::{DeviceError, DeviceValue, Element, HostRegion};
use spindle_kernels::cuda::ops::{launch_compact_rows, launch_identify, launch_sparse_layer};
use spindle_kernels::cuda::{get_device, CudaError, LayerShape, SparseLayerArgs};

use crate::accelerator::{Accelerator, CompactLaunch, DeviceProperties, SparseLayerLaunch};

/// Device memory holding `len` values of `E`.
pub struct CudaBuffer<E> {
    slice: Arc<CudaSlice<u8>>,
    len: usize,
    _marker: PhantomData<E>,
}

impl<E> CudaBuffer<E> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn ptr(&self) -> sys::CUdeviceptr {
        *self.slice.device_ptr()
    }
}

pub struct CudaStreamHandle {
    inner: CudaStream,
    label: String,
}

unsafe impl Send for CudaStreamHandle {}

impl CudaStreamHandle {
    pub fn label(&self) -> &str {
        &self.label
    }
}

pub struct CudaEvent {
    event: sys::CUevent,
    dev: Arc<CudaDevice>,
}

// The handle is only passed to driver calls, which are thread safe.
unsafe impl Send for CudaEvent {}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if self.dev.bind_to_thread().is_ok() {
            let _ = unsafe { result::event::destroy(self.event) };
        }
    }
}

pub struct CudaGraph {
    exec: sys::CUgraphExec,
    graph: sys::CUgraph,
    dev: Arc<CudaDevice>,
}

unsafe impl Send for CudaGraph {}

impl Drop for CudaGraph {
    fn drop(&mut self) {
        if self.dev.bind_to_thread().is_ok() {
            unsafe {
                let _ = sys::lib().cuGraphExecDestroy(self.exec).result();
                let _ = sys::lib().cuGraphDestroy(self.graph).result();
            }
        }
    }
}

/// Page-lock of the host weight region; unregistered on drop.
pub struct CudaPin {
    region: Arc<HostRegion>,
    dev: Arc<CudaDevice>,
}

impl Drop for CudaPin {
    fn drop(&mut self) {
        if self.dev.bind_to_thread().is_ok() {
            let ptr = self.region.words().as_ptr() as *mut std::ffi::c_void;
            if let Err(e) = unsafe { sys::lib().cuMemHostUnregister(ptr).result() } {
                tracing::warn!("failed to unpin host weights: {}", e);
            }
        }
    }
}

pub struct CudaAccelerator {
    dev: Arc<CudaDevice>,
    props: DeviceProperties,
}

impl CudaAccelerator {
    pub fn new(ordinal: usize) -> Result<Self, DeviceError> {
        let init = |e: &dyn std::fmt::Display| DeviceError::Init { device: ordinal, msg: e.to_string() };
        let dev = get_device(ordinal).map_err(|e| init(&e))?;
        let shared = dev
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)
            .map_err(|e| init(&e))?;
        let threads = dev
            .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .map_err(|e| init(&e))?;
        let total = unsafe { result::device::total_mem(*dev.cu_device()) }.map_err(|e| init(&e))?;
        let name = dev.name().map_err(|e| init(&e))?;
        tracing::info!("CUDA device {}: {} ({} MiB, {} bytes shared per block)", ordinal, name, total >> 20, shared);
        Ok(Self {
            dev,
            props: DeviceProperties {
                name,
                ordinal,
                shared_mem_per_block: shared.max(0) as usize,
                max_threads_per_block: threads.max(0) as usize,
                total_memory: total,
            },
        })
    }

    /// Open the first `count` GPUs.
    pub fn devices(count: usize) -> Result<Vec<Self>, DeviceError> {
        let visible = spindle_kernels::cuda::device_count();
        if count > visible {
            return Err(DeviceError::Init {
                device: visible,
                msg: format!("{count} devices requested, {visible} visible"),
            });
        }
        (0..count).map(Self::new).collect()
    }

    fn bind(&self) -> Result<(), DeviceError> {
        self.dev.bind_to_thread().map_err(|e| self.sync_error(e))
    }

    fn sync_error(&self, e: DriverError) -> DeviceError {
        DeviceError::Sync { device: self.props.ordinal, msg: e.to_string() }
    }

    fn copy_error(&self, msg: impl Into<String>) -> DeviceError {
        DeviceError::Copy { device: self.props.ordinal, msg: msg.into() }
    }

    fn launch_error(&self, kernel: &str, e: impl std::fmt::Display) -> DeviceError {
        DeviceError::Launch { device: self.props.ordinal, kernel: kernel.to_string(), msg: e.to_string() }
    }

    fn capture_error(&self, e: DriverError) -> DeviceError {
        DeviceError::Capture { device: self.props.ordinal, msg: e.to_string() }
    }

    fn kernel_error(&self, kernel: &str, e: CudaError) -> DeviceError {
        self.launch_error(kernel, e)
    }
}

impl Accelerator for CudaAccelerator {
    type Stream = CudaStreamHandle;
    type Event = CudaEvent;
    type Buffer<E: DeviceValue> = CudaBuffer<E>;
    type Graph = CudaGraph;
    type HostPin = CudaPin;

    fn ordinal(&self) -> usize {
        self.props.ordinal
    }

    fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    fn create_stream(&self, label: &str) -> Result<CudaStreamHandle, DeviceError> {
        let inner = self.dev.fork_default_stream().map_err(|e| DeviceError::Init {
            device: self.props.ordinal,
            msg: format!("stream '{label}': {e}"),
        })?;
        Ok(CudaStreamHandle { inner, label: label.to_string() })
    }

    fn create_event(&self) -> Result<CudaEvent, DeviceError> {
        self.bind()?;
        let event = result::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| DeviceError::Init { device: self.props.ordinal, msg: format!("event: {e}") })?;
        Ok(CudaEvent { event, dev: Arc::clone(&self.dev) })
    }

    fn record_event(&self, event: &CudaEvent, stream: &CudaStreamHandle) -> Result<(), DeviceError> {
        self.bind()?;
        unsafe { result::event::record(event.event, stream.inner.stream) }.map_err(|e| self.sync_error(e))
    }

    fn wait_event(&self, stream: &CudaStreamHandle, event: &CudaEvent) -> Result<(), DeviceError> {
        self.bind()?;
        unsafe {
            result::stream::wait_event(stream.inner.stream, event.event, sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT)
        }
        .map_err(|e| self.sync_error(e))
    }

    fn synchronize_event(&self, event: &CudaEvent) -> Result<(), DeviceError> {
        self.bind()?;
        unsafe { sys::lib().cuEventSynchronize(event.event).result() }.map_err(|e| self.sync_error(e))
    }

    fn synchronize(&self, stream: &CudaStreamHandle) -> Result<(), DeviceError> {
        self.bind()?;
        unsafe { result::stream::synchronize(stream.inner.stream) }.map_err(|e| self.sync_error(e))
    }

    fn alloc_zeros<E: DeviceValue>(&self, len: usize) -> Result<CudaBuffer<E>, DeviceError> {
        let bytes = len * std::mem::size_of::<E>();
        let alloc_error = |e: DriverError| DeviceError::Alloc {
            device: self.props.ordinal,
            bytes,
            msg: e.to_string(),
        };
        let slice = self.dev.alloc_zeros::<u8>(bytes.max(1)).map_err(alloc_error)?;
        // Allocation runs on the device stream; forked streams do not order after it.
        self.dev.synchronize().map_err(alloc_error)?;
        Ok(CudaBuffer { slice: Arc::new(slice), len, _marker: PhantomData })
    }

    fn pin_host(&self, region: &Arc<HostRegion>) -> Result<CudaPin, DeviceError> {
        self.bind()?;
        let ptr = region.words().as_ptr() as *mut std::ffi::c_void;
        unsafe { sys::lib().cuMemHostRegister_v2(ptr, region.len_bytes(), sys::CU_MEMHOSTREGISTER_PORTABLE) }
            .result()
            .map_err(|e| DeviceError::Alloc {
                device: self.props.ordinal,
                bytes: region.len_bytes(),
                msg: format!("cannot pin host weights: {e}"),
            })?;
        tracing::debug!("device {}: pinned {} bytes of host weights", self.props.ordinal, region.len_bytes());
        Ok(CudaPin { region: Arc::clone(region), dev: Arc::clone(&self.dev) })
    }

    fn copy_region_async(
        &self,
        stream: &CudaStreamHandle,
        pin: &CudaPin,
        words: Range<usize>,
        dst: &CudaBuffer<u64>,
    ) -> Result<(), DeviceError> {
        let src = pin
            .region
            .words()
            .get(words.clone())
            .ok_or_else(|| self.copy_error(format!("words {words:?} outside the pinned region")))?;
        if src.len() > dst.len() {
            return Err(self.copy_error(format!("{} words into a buffer of {}", src.len(), dst.len())));
        }
        self.bind()?;
        // The region is pinned and outlives the pin guard, so the copy may stay in flight.
        unsafe { result::memcpy_htod_async(dst.ptr(), src, stream.inner.stream) }
            .map_err(|e| self.copy_error(e.to_string()))
    }

    fn upload<E: DeviceValue>(
        &self,
        stream: &CudaStreamHandle,
        src: &[E],
        dst: &CudaBuffer<E>,
    ) -> Result<(), DeviceError> {
        if src.len() > dst.len() {
            return Err(self.copy_error(format!("{} values into a buffer of {}", src.len(), dst.len())));
        }
        if src.is_empty() {
            return Ok(());
        }
        self.bind()?;
        unsafe {
            result::memcpy_htod_async(dst.ptr(), src, stream.inner.stream)
                .and_then(|_| result::stream::synchronize(stream.inner.stream))
        }
        .map_err(|e| self.copy_error(e.to_string()))
    }

    fn read<E: DeviceValue>(
        &self,
        stream: &CudaStreamHandle,
        src: &CudaBuffer<E>,
        len: usize,
    ) -> Result<Vec<E>, DeviceError> {
        if len > src.len() {
            return Err(self.copy_error(format!("read of {} values from a buffer of {}", len, src.len())));
        }
        let mut out = vec![<E as bytemuck::Zeroable>::zeroed(); len];
        if len == 0 {
            return Ok(out);
        }
        self.bind()?;
        unsafe {
            result::memcpy_dtoh_async(&mut out[..], src.ptr(), stream.inner.stream)
                .and_then(|_| result::stream::synchronize(stream.inner.stream))
        }
        .map_err(|e| self.copy_error(e.to_string()))?;
        Ok(out)
    }

    fn fill_zero_async<E: DeviceValue>(&self, stream: &CudaStreamHandle, buf: &CudaBuffer<E>) -> Result<(), DeviceError> {
        self.bind()?;
        let bytes = buf.len() * std::mem::size_of::<E>();
        unsafe { result::memset_d8_async(buf.ptr(), 0, bytes, stream.inner.stream) }
            .map_err(|e| self.copy_error(e.to_string()))
    }

    fn launch_sparse_layer<T: Element>(
        &self,
        stream: &CudaStreamHandle,
        launch: &SparseLayerLaunch<'_, Self, T>,
    ) -> Result<(), DeviceError> {
        launch
            .block
            .validate(self.props.max_threads_per_block)
            .map_err(|e| self.launch_error("sparse_layer", e))?;
        let args = SparseLayerArgs {
            features_in: &launch.features_in.slice,
            active_count: &launch.active_count.slice,
            rows_in: &launch.rows_in.slice,
            row_len_in: &launch.row_len_in.slice,
            weights: &launch.weights.slice,
            features_out: &launch.features_out.slice,
            row_len_out: &launch.row_len_out.slice,
            shape: LayerShape::from_layout(&launch.layout),
            bias: launch.bias,
            cap: launch.cap,
            grid_rows: launch.grid_rows,
            block: (launch.block.x, launch.block.y, launch.block.z),
        };
        launch_sparse_layer::<T>(&self.dev, self.props.ordinal, &stream.inner, &args)
            .map_err(|e| self.kernel_error("sparse_layer", e))
    }

    fn launch_compact(&self, stream: &CudaStreamHandle, launch: &CompactLaunch<'_, Self>) -> Result<(), DeviceError> {
        launch_compact_rows(
            &self.dev,
            self.props.ordinal,
            &stream.inner,
            &launch.row_len.slice,
            launch.rows,
            &launch.rows_out.slice,
            &launch.active_count.slice,
            &launch.history.slice,
            launch.slot,
        )
        .map_err(|e| self.kernel_error("compact_rows", e))
    }

    fn launch_identify<T: Element>(
        &self,
        stream: &CudaStreamHandle,
        features: &CudaBuffer<T>,
        rows: usize,
        neurons: usize,
        results: &CudaBuffer<i32>,
    ) -> Result<(), DeviceError> {
        launch_identify::<T>(&self.dev, self.props.ordinal, &stream.inner, &features.slice, rows, neurons, &results.slice)
            .map_err(|e| self.kernel_error("identify", e))
    }

    fn begin_capture(&self, stream: &CudaStreamHandle) -> Result<(), DeviceError> {
        self.bind()?;
        unsafe {
            sys::lib()
                .cuStreamBeginCapture_v2(stream.inner.stream, sys::CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_RELAXED)
                .result()
        }
        .map_err(|e| self.capture_error(e))
    }

    fn end_capture(&self, stream: &CudaStreamHandle) -> Result<CudaGraph, DeviceError> {
        self.bind()?;
        let mut graph: sys::CUgraph = std::ptr::null_mut();
        unsafe { sys::lib().cuStreamEndCapture(stream.inner.stream, &mut graph).result() }
            .map_err(|e| self.capture_error(e))?;
        let mut exec: sys::CUgraphExec = std::ptr::null_mut();
        if let Err(e) = unsafe { sys::lib().cuGraphInstantiateWithFlags(&mut exec, graph, 0).result() } {
            unsafe {
                let _ = sys::lib().cuGraphDestroy(graph).result();
            }
            return Err(self.capture_error(e));
        }
        Ok(CudaGraph { exec, graph, dev: Arc::clone(&self.dev) })
    }

    fn launch_graph(&self, graph: &CudaGraph, stream: &CudaStreamHandle) -> Result<(), DeviceError> {
        self.bind()?;
        unsafe { sys::lib().cuGraphLaunch(graph.exec, stream.inner.stream).result() }
            .map_err(|e| self.launch_error("graph", e))
    }
}
