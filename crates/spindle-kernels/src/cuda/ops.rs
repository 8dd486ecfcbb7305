//! CUDA kernel dispatch for the sparse pipeline.
//!
//! Every function loads the module on first use (compiled from the embedded
//! `.cu` source) and enqueues the kernel on the caller's stream. Buffers are
//! raw byte slices; the element type is chosen by the function variant.

use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice, CudaStream, DeviceRepr, LaunchAsync};

use spindle_core::{Element, PackedLayout, Precision};

use super::context::CudaError;
use super::launch::{get_or_load_func, grid_1d, grid_per_item};

const SPARSE_CU: &str = include_str!("kernels/sparse.cu");
const MODULE: &str = "spindle_sparse";
const FUNCS: &[&str] = &[
    "sparse_layer_f32",
    "sparse_layer_f64",
    "compact_rows",
    "identify_f32",
    "identify_f64",
];

const IDENTIFY_BLOCK: usize = 512;
const IDENTIFY_MAX_BLOCKS: usize = 16;

/// Kernel-side description of a packed weight slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerShape {
    pub neurons: i32,
    pub col_blk: i32,
    pub n_slab: i32,
    pub cols_offset: i32,
    pub vals_offset: i32,
}

unsafe impl DeviceRepr for LayerShape {}

impl LayerShape {
    pub fn from_layout(layout: &PackedLayout) -> Self {
        Self {
            neurons: layout.neurons as i32,
            col_blk: layout.tiling.col_blk as i32,
            n_slab: layout.tiling.n_slab as i32,
            cols_offset: layout.cols_offset() as i32,
            vals_offset: layout.vals_offset() as i32,
        }
    }
}

/// Device buffers and launch geometry of one sparse layer.
pub struct SparseLayerArgs<'a> {
    pub features_in: &'a CudaSlice<u8>,
    /// Device-resident active-row count; blocks past it exit immediately.
    pub active_count: &'a CudaSlice<u8>,
    pub rows_in: &'a CudaSlice<u8>,
    pub row_len_in: &'a CudaSlice<u8>,
    pub weights: &'a CudaSlice<u8>,
    pub features_out: &'a CudaSlice<u8>,
    pub row_len_out: &'a CudaSlice<u8>,
    pub shape: LayerShape,
    pub bias: f64,
    pub cap: f64,
    /// Blocks to launch; at least the active count.
    pub grid_rows: usize,
    pub block: (u32, u32, u32),
}

pub fn launch_sparse_layer<T: Element>(
    dev: &Arc<CudaDevice>,
    ordinal: usize,
    stream: &CudaStream,
    args: &SparseLayerArgs<'_>,
) -> Result<(), CudaError> {
    let shared = (args.shape.col_blk as usize * std::mem::size_of::<T>()) as u32;
    let cfg = grid_per_item(args.grid_rows, args.block, shared);
    let launched = match T::PRECISION {
        Precision::F32 => {
            let f = get_or_load_func(dev, ordinal, MODULE, "sparse_layer_f32", SPARSE_CU, FUNCS)?;
            let params = (
                args.features_in,
                args.active_count,
                args.rows_in,
                args.row_len_in,
                args.weights,
                args.shape,
                args.bias as f32,
                args.cap as f32,
                args.features_out,
                args.row_len_out,
            );
            unsafe { f.launch_on_stream(stream, cfg, params) }
        }
        Precision::F64 => {
            let f = get_or_load_func(dev, ordinal, MODULE, "sparse_layer_f64", SPARSE_CU, FUNCS)?;
            let params = (
                args.features_in,
                args.active_count,
                args.rows_in,
                args.row_len_in,
                args.weights,
                args.shape,
                args.bias,
                args.cap,
                args.features_out,
                args.row_len_out,
            );
            unsafe { f.launch_on_stream(stream, cfg, params) }
        }
    };
    launched.map_err(|e| CudaError::LaunchError(format!("sparse_layer: {e}")))
}

/// Gather active rows on the device and record the count at `history[slot]`.
#[allow(clippy::too_many_arguments)]
pub fn launch_compact_rows(
    dev: &Arc<CudaDevice>,
    ordinal: usize,
    stream: &CudaStream,
    row_len: &CudaSlice<u8>,
    rows: usize,
    rows_out: &CudaSlice<u8>,
    active_count: &CudaSlice<u8>,
    history: &CudaSlice<u8>,
    slot: usize,
) -> Result<(), CudaError> {
    let f = get_or_load_func(dev, ordinal, MODULE, "compact_rows", SPARSE_CU, FUNCS)?;
    let cfg = grid_1d(1, 1, 1);
    let params = (row_len, rows as i32, rows_out, active_count, history, slot as i32);
    unsafe { f.launch_on_stream(stream, cfg, params) }
        .map_err(|e| CudaError::LaunchError(format!("compact_rows: {e}")))
}

pub fn launch_identify<T: Element>(
    dev: &Arc<CudaDevice>,
    ordinal: usize,
    stream: &CudaStream,
    features: &CudaSlice<u8>,
    rows: usize,
    neurons: usize,
    results: &CudaSlice<u8>,
) -> Result<(), CudaError> {
    let name = match T::PRECISION {
        Precision::F32 => "identify_f32",
        Precision::F64 => "identify_f64",
    };
    let f = get_or_load_func(dev, ordinal, MODULE, name, SPARSE_CU, FUNCS)?;
    let cfg = grid_1d(rows, IDENTIFY_BLOCK, IDENTIFY_MAX_BLOCKS);
    let params = (features, rows as i32, neurons as i32, results);
    unsafe { f.launch_on_stream(stream, cfg, params) }
        .map_err(|e| CudaError::LaunchError(format!("{name}: {e}")))
}
