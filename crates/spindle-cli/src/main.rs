use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use spindle_core::format::{self, convert_label_file, convert_text_file, convert_weight_dir};
use spindle_core::{
    BackendKind, Element, EngineConfig, InputBatch, Precision, ScoreReport, SpindleError, StrategyKind,
    ThreadBlock, Tiling, WeightStore,
};
use spindle_kernels::reference::classify_dense;
use spindle_kernels::Activation;
use spindle_runtime::{tiling_budget, Accelerator, DeviceProperties, HostAccelerator, InferenceOutcome, Orchestrator};

#[derive(Parser)]
#[command(
    name = "spindle",
    about = "Pipelined multi-device sparse DNN inference",
    long_about = "Runs a deep, sparse, ReLU-style network over a batch of sparse inputs.\n\n\
                  Every layer's weights stream from pinned host memory into rotating device\n\
                  slots while the previous layer computes; rows that go dark stop costing work.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run inference over a batch and optionally score it
    Infer(InferArgs),
    /// Convert text datasets into the binary triple format
    Convert {
        #[command(subcommand)]
        what: ConvertCommand,
    },
    /// Compare binary predictions against golden labels
    Score {
        /// Binary label file written by `infer --output`
        predictions: PathBuf,
        /// Binary golden label file
        golden: PathBuf,
    },
    /// Show devices and the tiling a network shape would use
    Info {
        #[arg(long, default_value = "1024")]
        neurons: usize,
        #[arg(long, default_value = "f32")]
        precision: Precision,
        #[arg(long, default_value = "host")]
        backend: BackendKind,
        #[arg(long, default_value = "1")]
        devices: usize,
        /// Fast memory per block in bytes, overriding the device query
        #[arg(long)]
        shared_mem: Option<usize>,
    },
}

#[derive(clap::Subcommand)]
enum ConvertCommand {
    /// Convert `n{N}-l{k}.tsv` layer files into `n{N}-l{k}.b`
    Weights {
        #[arg(long)]
        text_dir: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value = "1024")]
        neurons: usize,
        #[arg(long, default_value = "120")]
        layers: usize,
        #[arg(long, default_value = "f32")]
        precision: Precision,
    },
    /// Convert a text input batch
    Input {
        text: PathBuf,
        out: PathBuf,
        #[arg(long, default_value = "f32")]
        precision: Precision,
    },
    /// Convert a text golden label file
    Golden { text: PathBuf, out: PathBuf },
}

/// Flags override the JSON config file, which overrides the defaults.
#[derive(clap::Args)]
struct InferArgs {
    /// JSON engine configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// baseline, pipelined or task-graph
    #[arg(long)]
    strategy: Option<StrategyKind>,
    #[arg(long)]
    precision: Option<Precision>,
    /// host or cuda
    #[arg(long)]
    backend: Option<BackendKind>,
    /// Directory of binary weight files
    #[arg(long)]
    weights: Option<PathBuf>,
    /// Binary input batch
    #[arg(long)]
    input: Option<PathBuf>,
    /// Binary golden labels
    #[arg(long)]
    golden: Option<PathBuf>,
    #[arg(long)]
    neurons: Option<usize>,
    #[arg(long)]
    layers: Option<usize>,
    #[arg(long, allow_hyphen_values = true)]
    bias: Option<f64>,
    /// Upper clamp of the activation
    #[arg(long)]
    cap: Option<f64>,
    #[arg(long)]
    devices: Option<usize>,
    /// Device-resident weight slots per device
    #[arg(long)]
    buffers: Option<usize>,
    /// Rows in the input batch
    #[arg(long)]
    batch: Option<usize>,
    /// Sparse kernel thread block as "x,y,z"
    #[arg(long)]
    block: Option<ThreadBlock>,
    /// Fast memory per block in bytes, overriding the device query
    #[arg(long)]
    shared_mem: Option<usize>,
    /// Write predicted classes as a binary label file
    #[arg(long)]
    output: Option<PathBuf>,
    /// Write a JSON run report
    #[arg(long)]
    report: Option<PathBuf>,
    /// Also run the dense host reference and compare classes
    #[arg(long)]
    verify_dense: bool,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Infer(args) => cmd_infer(&args),
        Commands::Convert { what } => cmd_convert(what),
        Commands::Score { predictions, golden } => cmd_score(&predictions, &golden),
        Commands::Info { neurons, precision, backend, devices, shared_mem } => {
            cmd_info(neurons, precision, backend, devices, shared_mem)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let category = e.chain().find_map(|c| c.downcast_ref::<SpindleError>()).map(|s| s.category());
            match category {
                Some(category) => eprintln!("error [{category}]: {e:#}"),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

// ============================================================================
// infer
// ============================================================================

fn resolve_config(args: &InferArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path).context("reading engine configuration")?,
        None => EngineConfig::default(),
    };
    macro_rules! apply {
        ($($flag:ident => $field:ident),* $(,)?) => {
            $(if let Some(v) = args.$flag.clone() { config.$field = v; })*
        };
    }
    apply!(
        strategy => strategy,
        precision => precision,
        backend => backend,
        weights => weight_dir,
        input => input_path,
        neurons => neurons,
        layers => layers,
        bias => bias,
        cap => activation_cap,
        devices => devices,
        buffers => buffers_per_device,
        batch => batch_size,
        block => thread_block,
    );
    if args.golden.is_some() {
        config.golden_path = args.golden.clone();
    }
    if args.shared_mem.is_some() {
        config.shared_mem_bytes = args.shared_mem;
    }
    config.validate().context("validating engine configuration")?;
    if config.weight_dir.as_os_str().is_empty() || config.input_path.as_os_str().is_empty() {
        bail!("both a weight directory (--weights) and an input batch (--input) are required");
    }
    Ok(config)
}

fn cmd_infer(args: &InferArgs) -> Result<()> {
    let config = resolve_config(args)?;
    tracing::info!(
        "{} layers x {} neurons, {} rows, {} on {} {} device(s)",
        config.layers,
        config.neurons,
        config.batch_size,
        config.strategy,
        config.devices,
        config.backend
    );
    match config.precision {
        Precision::F32 => infer_with::<f32>(config, args),
        Precision::F64 => infer_with::<f64>(config, args),
    }
}

fn infer_with<T: Element>(config: EngineConfig, args: &InferArgs) -> Result<()> {
    match config.backend {
        BackendKind::Host => {
            let devices = HostAccelerator::devices(config.devices);
            run_pipeline::<HostAccelerator, T>(config, devices, args)
        }
        BackendKind::Cuda => run_cuda::<T>(config, args),
    }
}

#[cfg(feature = "cuda")]
fn run_cuda<T: Element>(config: EngineConfig, args: &InferArgs) -> Result<()> {
    let devices = spindle_runtime::CudaAccelerator::devices(config.devices)
        .map_err(SpindleError::from)
        .context("init phase: CUDA devices")?;
    run_pipeline::<spindle_runtime::CudaAccelerator, T>(config, devices, args)
}

#[cfg(not(feature = "cuda"))]
fn run_cuda<T: Element>(_config: EngineConfig, _args: &InferArgs) -> Result<()> {
    bail!("this build has no CUDA support; rebuild with `--features cuda`")
}

#[derive(Serialize)]
struct PhaseTimings {
    load_s: f64,
    preprocess_s: f64,
    infer_s: f64,
}

#[derive(Serialize)]
struct RunReport<'a> {
    config: &'a EngineConfig,
    timings: PhaseTimings,
    nnz_per_layer: &'a [usize],
    outcome: &'a InferenceOutcome,
    score: Option<ScoreReport>,
}

fn run_pipeline<A: Accelerator, T: Element>(config: EngineConfig, devices: Vec<A>, args: &InferArgs) -> Result<()> {
    let start = Instant::now();
    let budget = tiling_budget(&config, &devices).context("load phase: device selection")?;
    let store = WeightStore::<T>::load(&config.weight_dir, config.layers, config.neurons, budget)
        .with_context(|| format!("load phase: weight store from {}", config.weight_dir.display()))?;
    let batch = InputBatch::<T>::load(&config.input_path, config.batch_size, config.neurons)
        .with_context(|| format!("load phase: input batch from {}", config.input_path.display()))?;
    let golden = match &config.golden_path {
        Some(path) => Some(
            format::read_labels(path).with_context(|| format!("load phase: golden labels from {}", path.display()))?,
        ),
        None => None,
    };
    let load_s = start.elapsed().as_secs_f64();
    let tiling = store.tiling();
    tracing::info!(
        "load: {} nonzeros, tile {}x{} ({:.3}s)",
        store.nnz().iter().sum::<usize>(),
        tiling.col_blk,
        tiling.n_slab,
        load_s
    );

    let start = Instant::now();
    let store = Arc::new(store);
    let mut orchestrator =
        Orchestrator::new(config.clone(), Arc::clone(&store), devices).context("preprocess phase: device pipelines")?;
    let preprocess_s = start.elapsed().as_secs_f64();
    tracing::info!("preprocess: {} pipeline(s) ready ({:.3}s)", orchestrator.pipelines().len(), preprocess_s);

    let start = Instant::now();
    let outcome = orchestrator.infer(&batch).context("infer phase: orchestrator")?;
    let infer_s = start.elapsed().as_secs_f64();
    let edges = store.nnz().iter().sum::<usize>() as f64 * config.batch_size as f64;
    tracing::info!("infer: {:.3}s ({:.3} GEdges/s)", infer_s, edges / infer_s / 1e9);

    for device in &outcome.devices {
        let last = device.active_history.last().copied().unwrap_or(0);
        println!(
            "device {}: rows {}..{}, {} active after the last layer",
            device.ordinal,
            device.first_row,
            device.first_row + device.rows,
            last
        );
    }
    let active = outcome.classes.iter().filter(|&&c| c >= 0).count();
    println!("{} of {} rows classified", active, outcome.classes.len());
    println!("timings: load {:.3}s, preprocess {:.3}s, infer {:.3}s", load_s, preprocess_s, infer_s);

    let score = match golden {
        Some(golden) => {
            let report = ScoreReport::score(&outcome.classes, &golden).context("score phase: golden labels")?;
            println!("{report}");
            Some(report)
        }
        None => None,
    };
    if let Some(report) = &score {
        // Mismatches are reported, never fatal.
        if let Err(e) = report.clone().into_result() {
            tracing::warn!("{}", e);
        }
    }

    if args.verify_dense {
        let expected = classify_dense(&store, &batch, Activation::new(config.bias, config.activation_cap));
        let differing = expected.iter().zip(&outcome.classes).filter(|(a, b)| a != b).count();
        if differing == 0 {
            println!("dense reference: all {} classes agree", expected.len());
        } else {
            tracing::warn!("dense reference disagrees on {} of {} rows", differing, expected.len());
        }
    }

    if let Some(path) = &args.output {
        format::write_labels(path, &outcome.classes)
            .with_context(|| format!("writing predictions to {}", path.display()))?;
    }
    if let Some(path) = &args.report {
        let report = RunReport {
            config: &config,
            timings: PhaseTimings { load_s, preprocess_s, infer_s },
            nnz_per_layer: store.nnz(),
            outcome: &outcome,
            score,
        };
        let file = std::fs::File::create(path).with_context(|| format!("creating report {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report).context("writing run report")?;
    }
    Ok(())
}

// ============================================================================
// convert / score / info
// ============================================================================

fn cmd_convert(what: ConvertCommand) -> Result<()> {
    match what {
        ConvertCommand::Weights { text_dir, out_dir, neurons, layers, precision } => {
            let total = match precision {
                Precision::F32 => convert_weight_dir::<f32>(&text_dir, &out_dir, neurons, layers),
                Precision::F64 => convert_weight_dir::<f64>(&text_dir, &out_dir, neurons, layers),
            }
            .with_context(|| format!("converting weights in {}", text_dir.display()))?;
            println!("{} layers, {} nonzeros -> {}", layers, total, out_dir.display());
        }
        ConvertCommand::Input { text, out, precision } => {
            let count = match precision {
                Precision::F32 => convert_text_file::<f32>(&text, &out),
                Precision::F64 => convert_text_file::<f64>(&text, &out),
            }
            .with_context(|| format!("converting input {}", text.display()))?;
            println!("{} nonzeros -> {}", count, out.display());
        }
        ConvertCommand::Golden { text, out } => {
            let count = convert_label_file(&text, &out).with_context(|| format!("converting labels {}", text.display()))?;
            println!("{} labels -> {}", count, out.display());
        }
    }
    Ok(())
}

fn cmd_score(predictions: &Path, golden: &Path) -> Result<()> {
    let predicted = format::read_labels(predictions).context("reading predictions")?;
    let golden = format::read_labels(golden).context("reading golden labels")?;
    let report = ScoreReport::score(&predicted, &golden)?;
    println!("{report}");
    for (row, got, want) in &report.first_mismatches {
        println!("  row {row}: predicted {got}, expected {want}");
    }
    if let Err(e) = report.into_result() {
        tracing::warn!("{}", e);
    }
    Ok(())
}

fn cmd_info(
    neurons: usize,
    precision: Precision,
    backend: BackendKind,
    devices: usize,
    shared_mem: Option<usize>,
) -> Result<()> {
    println!("spindle v{}", env!("CARGO_PKG_VERSION"));
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let props: Vec<_> = match backend {
        BackendKind::Host => HostAccelerator::devices(devices).iter().map(|d| d.properties().clone()).collect(),
        BackendKind::Cuda => cuda_properties(devices)?,
    };

    println!("\nDevices ({backend})");
    for p in &props {
        println!(
            "  [{}] {:<24} {:>6} KiB shared/block  {:>5} threads/block  {:>7} MiB",
            p.ordinal,
            p.name,
            p.shared_mem_per_block / 1024,
            p.max_threads_per_block,
            p.total_memory >> 20
        );
    }

    let capacity = props.iter().map(|p| p.shared_mem_per_block).min().unwrap_or(0);
    let budget = shared_mem.map_or(capacity, |s| s.min(capacity));
    let tiling = Tiling::derive(neurons, budget, precision.size()).context("deriving tiling")?;
    println!("\nTiling ({neurons} neurons, {precision}, {budget} bytes)");
    println!("  COL_BLK: {}", tiling.col_blk);
    println!("  N_SLAB:  {}", tiling.n_slab);
    println!("  tile:    {} bytes", tiling.tile_bytes(precision.size()));

    println!("\nStrategies");
    for kind in StrategyKind::ALL {
        let marker = if kind == StrategyKind::default() { " (default)" } else { "" };
        println!("  {kind}{marker}");
    }
    Ok(())
}

#[cfg(feature = "cuda")]
fn cuda_properties(devices: usize) -> Result<Vec<DeviceProperties>> {
    println!("  CUDA devices visible: {}", spindle_kernels::cuda::device_count());
    let devices = spindle_runtime::CudaAccelerator::devices(devices)
        .map_err(SpindleError::from)
        .context("opening CUDA devices")?;
    Ok(devices.iter().map(|d| d.properties().clone()).collect())
}

#[cfg(not(feature = "cuda"))]
fn cuda_properties(_devices: usize) -> Result<Vec<DeviceProperties>> {
    bail!("this build has no CUDA support; rebuild with `--features cuda`")
}
