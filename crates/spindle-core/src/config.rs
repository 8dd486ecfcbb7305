//! Configuration for a spindle inference run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dtype::Precision;
use crate::error::SpindleError;
use crate::Result;

/// How each device sequences its layer stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Blocking weight load before every layer, no overlap.
    Baseline,
    /// Double-buffered weight prefetch overlapped with compute.
    #[default]
    Pipelined,
    /// Per-layer dependency graphs captured once and replayed.
    TaskGraph,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] =
        [StrategyKind::Baseline, StrategyKind::Pipelined, StrategyKind::TaskGraph];
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Baseline => write!(f, "baseline"),
            StrategyKind::Pipelined => write!(f, "pipelined"),
            StrategyKind::TaskGraph => write!(f, "task-graph"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "baseline" | "naive" => Ok(StrategyKind::Baseline),
            "pipelined" | "pipeline" => Ok(StrategyKind::Pipelined),
            "task-graph" | "taskgraph" | "graph" => Ok(StrategyKind::TaskGraph),
            other => Err(format!(
                "unknown strategy '{other}' (expected baseline, pipelined or task-graph)"
            )),
        }
    }
}

/// Which accelerator implementation executes the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Host-emulated accelerator (worker-thread streams, rayon kernels).
    #[default]
    Host,
    /// CUDA GPUs (requires the `cuda` feature).
    Cuda,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Host => write!(f, "host"),
            BackendKind::Cuda => write!(f, "cuda"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(BackendKind::Host),
            "cuda" | "gpu" => Ok(BackendKind::Cuda),
            other => Err(format!("unknown backend '{other}' (expected host or cuda)")),
        }
    }
}

/// Kernel thread-block dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadBlock {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ThreadBlock {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Threads per block.
    pub fn threads(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize
    }

    /// Check the dimensions against a device's per-block thread limit.
    pub fn validate(&self, max_threads_per_block: usize) -> Result<()> {
        if self.x == 0 || self.y == 0 || self.z == 0 {
            return Err(SpindleError::config(format!(
                "thread block {self} has a zero dimension"
            )));
        }
        if self.threads() > max_threads_per_block {
            return Err(SpindleError::config(format!(
                "thread block {self} has {} threads, device limit is {max_threads_per_block}",
                self.threads()
            )));
        }
        Ok(())
    }
}

impl Default for ThreadBlock {
    fn default() -> Self {
        Self::new(2, 512, 1)
    }
}

impl fmt::Display for ThreadBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl FromStr for ThreadBlock {
    type Err = String;

    /// Parse `"x,y,z"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let dims: Vec<u32> = s
            .split(',')
            .map(|d| d.trim().parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| format!("invalid thread block '{s}': {e}"))?;
        match dims.as_slice() {
            [x, y, z] => Ok(Self::new(*x, *y, *z)),
            _ => Err(format!("thread block '{s}' must have exactly three dimensions")),
        }
    }
}

/// Configuration consumed by the inference core.
///
/// Every field has a default so partial JSON files are accepted; CLI flags
/// override whatever the file provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution strategy, chosen once per run.
    pub strategy: StrategyKind,

    /// Element type of weights and activations.
    pub precision: Precision,

    /// Accelerator implementation.
    pub backend: BackendKind,

    /// Directory holding one binary weight file per layer.
    pub weight_dir: PathBuf,

    /// Binary input batch file.
    pub input_path: PathBuf,

    /// Optional binary golden label file.
    pub golden_path: Option<PathBuf>,

    /// Neurons per layer.
    pub neurons: usize,

    /// Number of layers.
    pub layers: usize,

    /// Scalar bias added before the nonlinearity.
    pub bias: f64,

    /// Upper clamp of the nonlinearity.
    pub activation_cap: f64,

    /// Number of accelerators to shard the batch across.
    pub devices: usize,

    /// Device-resident weight slots per device (at least 2).
    pub buffers_per_device: usize,

    /// Rows in the input batch.
    pub batch_size: usize,

    /// Sparse kernel thread-block dimensions.
    pub thread_block: ThreadBlock,

    /// Fast on-chip memory per block, overriding the device query.
    pub shared_mem_bytes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            precision: Precision::default(),
            backend: BackendKind::default(),
            weight_dir: PathBuf::new(),
            input_path: PathBuf::new(),
            golden_path: None,
            neurons: 1024,
            layers: 120,
            bias: -0.3,
            activation_cap: 32.0,
            devices: 1,
            buffers_per_device: 2,
            batch_size: 60_000,
            thread_block: ThreadBlock::default(),
            shared_mem_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SpindleError::io(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| SpindleError::malformed(path, format!("invalid config JSON: {e}")))
    }

    /// Check the values that do not depend on a device.
    pub fn validate(&self) -> Result<()> {
        if self.neurons == 0 {
            return Err(SpindleError::config("neurons per layer must be positive"));
        }
        if self.layers == 0 {
            return Err(SpindleError::config("layer count must be positive"));
        }
        if self.batch_size == 0 {
            return Err(SpindleError::config("batch size must be positive"));
        }
        if self.devices == 0 {
            return Err(SpindleError::config("device count must be positive"));
        }
        if self.buffers_per_device < 2 {
            return Err(SpindleError::config(format!(
                "at least 2 weight buffers per device are required, got {}",
                self.buffers_per_device
            )));
        }
        if !self.bias.is_finite() {
            return Err(SpindleError::config("bias must be finite"));
        }
        if self.activation_cap.is_nan() || self.activation_cap <= 0.0 {
            return Err(SpindleError::config("activation cap must be positive"));
        }
        if self.neurons > i32::MAX as usize || self.batch_size > i32::MAX as usize {
            return Err(SpindleError::config("neurons and batch size must fit in i32"));
        }
        if self.thread_block.x == 0 || self.thread_block.y == 0 || self.thread_block.z == 0 {
            return Err(SpindleError::config(format!(
                "thread block {} has a zero dimension",
                self.thread_block
            )));
        }
        Ok(())
    }
}
