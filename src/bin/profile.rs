//! strata-profile: Measure inference latency of the runners on the reference engine.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;

use strata_runner::backend::host::HostDevice;
use strata_runner::cli::{self, RunnerSelection};
use strata_runner::engine::host::HostEngine;
use strata_runner::engine::BindingApi;
use strata_runner::profile::{ProfileReport, Profiler, ProfilerConfig};
use strata_runner::tensor::{DataType, Tensor};
use strata_runner::{CudaGraphRunner, Engine, InferenceRunner, Runner, RunnerStats};

#[derive(Parser)]
#[command(
    name = "strata-profile",
    about = "Profile direct and graph-captured inference on the reference engine"
)]
struct Args {
    /// Comma-separated batch sizes (e.g., "1,8,32")
    #[arg(short = 'b', long, default_value = "1,8,32", value_delimiter = ',')]
    batch_sizes: Vec<usize>,

    /// Unmeasured calls per batch size
    #[arg(long, default_value = "10")]
    warmup: usize,

    /// Measured calls per batch size
    #[arg(short = 'n', long, default_value = "100")]
    iterations: usize,

    /// Profiler config JSON; overrides --batch-sizes, --warmup and --iterations
    #[arg(long)]
    config: Option<PathBuf>,

    /// Feature width of the reference engine's input
    #[arg(long, default_value = "256")]
    features: usize,

    /// Binding API of the reference engine: named or legacy
    #[arg(long, default_value = "named", value_parser = cli::parse_binding_api)]
    api: BindingApi,

    /// Runners to profile: direct, graph, or both
    #[arg(long, default_value = "both", value_parser = cli::parse_runner_selection)]
    runner: RunnerSelection,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

#[derive(Serialize)]
struct RunnerOutput {
    runner: String,
    stats: RunnerStats,
    reports: Vec<ProfileReport>,
}

#[derive(Serialize)]
struct JsonOutput {
    device: String,
    api: String,
    features: usize,
    runners: Vec<RunnerOutput>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// `y = tanh(x * 0.5 + 0.1)`, row-wise over `[batch, features]`.
fn reference_engine(device: Arc<HostDevice>, features: usize, api: BindingApi) -> HostEngine {
    HostEngine::builder(device)
        .input("x", vec![-1, features as i64], DataType::F32)
        .output("y", vec![-1, features as i64], DataType::F32)
        .api(api)
        .kernel(|inputs| {
            let x = &inputs[0];
            let data = x.as_f32().iter().map(|v| (v * 0.5 + 0.1).tanh()).collect();
            Ok(vec![Tensor::new(x.shape().to_vec(), data)])
        })
        .build()
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => ProfilerConfig::from_json_file(path)?,
        None => ProfilerConfig {
            warmup: args.warmup,
            iterations: args.iterations,
            batch_sizes: args.batch_sizes.clone(),
        },
    };

    let device = Arc::new(HostDevice::new());
    let engine: Arc<dyn Engine> =
        Arc::new(reference_engine(device.clone(), args.features, args.api));
    let profiler = Profiler::new(config);

    let mut runners: Vec<Box<dyn InferenceRunner>> = Vec::new();
    if args.runner.includes_direct() {
        runners.push(Box::new(Runner::new(engine.clone())));
    }
    if args.runner.includes_graph() {
        runners.push(Box::new(CudaGraphRunner::new(engine.clone())));
    }

    let mut outputs = Vec::with_capacity(runners.len());
    for runner in runners.iter_mut() {
        let reports = profiler.run(&mut **runner)?;
        outputs.push(RunnerOutput {
            runner: runner.name().to_string(),
            stats: runner.stats(),
            reports,
        });
    }

    let output = JsonOutput {
        device: engine.device().name().to_string(),
        api: format!("{:?}", args.api).to_lowercase(),
        features: args.features,
        runners: outputs,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
