//! NVRTC compilation and per-device module caching.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use cudarc::driver::{CudaDevice, CudaFunction, LaunchConfig};
use cudarc::nvrtc::CompileOptions;
use parking_lot::Mutex;

use super::context::CudaError;

/// Lowest architecture with double-precision `atomicAdd`.
const ARCH: &str = "compute_70";

/// Key: (device ordinal, module name).
static LOADED: OnceLock<Mutex<HashSet<(usize, String)>>> = OnceLock::new();

fn loaded_set() -> &'static Mutex<HashSet<(usize, String)>> {
    LOADED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Compile and load a module on a device. No-op if already loaded.
pub fn ensure_module(
    device: &Arc<CudaDevice>,
    ordinal: usize,
    module_name: &str,
    source: &str,
    func_names: &[&'static str],
) -> Result<(), CudaError> {
    let key = (ordinal, module_name.to_string());
    // Held across compilation so concurrent first launches compile once.
    let mut set = loaded_set().lock();
    if set.contains(&key) {
        return Ok(());
    }

    let opts = CompileOptions { arch: Some(ARCH), ..Default::default() };
    let ptx = cudarc::nvrtc::compile_ptx_with_opts(source, opts).map_err(|e| {
        CudaError::PtxCompile { module: module_name.to_string(), msg: e.to_string() }
    })?;

    device.load_ptx(ptx, module_name, func_names).map_err(|e| CudaError::ModuleLoad {
        module: module_name.to_string(),
        msg: e.to_string(),
    })?;
    tracing::debug!("loaded CUDA module '{}' on device {}", module_name, ordinal);

    set.insert(key);
    Ok(())
}

/// Get a kernel handle, compiling its module on first use.
pub fn get_or_load_func(
    device: &Arc<CudaDevice>,
    ordinal: usize,
    module_name: &str,
    func_name: &str,
    source: &str,
    func_names: &[&'static str],
) -> Result<CudaFunction, CudaError> {
    ensure_module(device, ordinal, module_name, source, func_names)?;
    device.get_func(module_name, func_name).ok_or_else(|| CudaError::FuncNotFound {
        module: module_name.to_string(),
        func: func_name.to_string(),
    })
}

/// One block per item with a 3D thread block and dynamic shared memory.
pub fn grid_per_item(items: usize, block: (u32, u32, u32), shared_bytes: u32) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (items.max(1) as u32, 1, 1),
        block_dim: block,
        shared_mem_bytes: shared_bytes,
    }
}

/// Grid-stride launch over `n` items.
pub fn grid_1d(n: usize, block_size: usize, max_blocks: usize) -> LaunchConfig {
    let grid = ((n + block_size - 1) / block_size).clamp(1, max_blocks);
    LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}
