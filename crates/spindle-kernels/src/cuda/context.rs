//! CUDA device context management.
//!
//! Lazily initialized `CudaDevice` handles per GPU ordinal, shared by every
//! pipeline placed on that GPU.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use cudarc::driver::CudaDevice;
use parking_lot::Mutex;

static DEVICES: OnceLock<Mutex<HashMap<usize, Arc<CudaDevice>>>> = OnceLock::new();

fn devices() -> &'static Mutex<HashMap<usize, Arc<CudaDevice>>> {
    DEVICES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the device handle of a GPU ordinal.
pub fn get_device(ordinal: usize) -> Result<Arc<CudaDevice>, CudaError> {
    let mut map = devices().lock();
    if let Some(dev) = map.get(&ordinal) {
        return Ok(Arc::clone(dev));
    }
    let dev = CudaDevice::new(ordinal)
        .map_err(|e| CudaError::DeviceInit(format!("device {}: {}", ordinal, e)))?;
    map.insert(ordinal, Arc::clone(&dev));
    Ok(dev)
}

/// Number of visible CUDA devices.
pub fn device_count() -> usize {
    CudaDevice::count().map(|n| n.max(0) as usize).unwrap_or(0)
}

/// CUDA-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum CudaError {
    #[error("CUDA device init failed: {0}")]
    DeviceInit(String),

    #[error("PTX compilation failed for module '{module}': {msg}")]
    PtxCompile { module: String, msg: String },

    #[error("Failed to load module '{module}': {msg}")]
    ModuleLoad { module: String, msg: String },

    #[error("Function '{func}' not found in module '{module}'")]
    FuncNotFound { module: String, func: String },

    #[error("CUDA kernel launch failed: {0}")]
    LaunchError(String),
}
