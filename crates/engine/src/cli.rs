//! CLI wiring for the parafit engine.

use crate::options::{BackendSelection, EngineOptions};
use crate::random::SampleRequest;
use crate::session::Engine;
use anyhow::Result;
use clap::{Parser, Subcommand};
use parafit_ir::{ElementType, Precision};
use parafit_kernels::{seed_table, HostBuffer, Input, KernelData, KernelInputs, RNG_STATE};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "parafit", about = "Batched numeric routines across compute backends")]
pub struct Cli {
    #[arg(long, value_enum)]
    pub backends: Option<BackendArg>,

    /// Maximum instances per batch.
    #[arg(long)]
    pub batch_length: Option<usize>,

    /// CPU worker threads.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Engine options as JSON; flags override its fields.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum BackendArg {
    All,
    Cpu,
    Gpu,
}

impl From<BackendArg> for BackendSelection {
    fn from(value: BackendArg) -> BackendSelection {
        match value {
            BackendArg::All => BackendSelection::All,
            BackendArg::Cpu => BackendSelection::Cpu,
            BackendArg::Gpu => BackendSelection::Gpu,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ElementArg {
    F32,
    F64,
}

impl From<ElementArg> for ElementType {
    fn from(value: ElementArg) -> ElementType {
        match value {
            ElementArg::F32 => ElementType::F32,
            ElementArg::F64 => ElementType::F64,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct SampleArgs {
    #[arg(long, default_value_t = 1)]
    pub instances: usize,
    #[arg(long, default_value_t = 10)]
    pub samples: usize,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, value_enum, default_value = "f64")]
    pub element: ElementArg,
}

impl SampleArgs {
    fn request(&self) -> SampleRequest {
        let request = SampleRequest::new(self.instances, self.samples).element(self.element.into());
        match self.seed {
            Some(seed) => request.seed(seed),
            None => request,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the backends the engine enumerates.
    Backends,
    /// Print uniform draws as a JSON matrix.
    Rand {
        #[command(flatten)]
        sample: SampleArgs,
        #[arg(long, default_value_t = 0.0)]
        min: f64,
        #[arg(long, default_value_t = 1.0)]
        max: f64,
    },
    /// Print Gaussian draws as a JSON matrix.
    Randn {
        #[command(flatten)]
        sample: SampleArgs,
        #[arg(long, default_value_t = 0.0)]
        mean: f64,
        #[arg(long, default_value_t = 1.0)]
        std: f64,
    },
    /// Time the uniform sampler on every backend and print relative weights.
    Calibrate {
        #[arg(long, default_value_t = 10_000)]
        instances: usize,
        #[arg(long, default_value_t = 64)]
        samples: usize,
        /// Calibration cache file; profiles found there are reused.
        #[arg(long)]
        cache: Option<PathBuf>,
    },
}

impl Cli {
    pub fn engine_options(&self) -> Result<EngineOptions> {
        let mut options = match &self.config {
            Some(path) => EngineOptions::from_json_file(path)?,
            None => EngineOptions::default(),
        };
        if let Some(backends) = self.backends {
            options.backends = backends.into();
        }
        if let Some(length) = self.batch_length {
            options.single_batch_length = Some(length);
        }
        if let Some(threads) = self.threads {
            options.cpu_threads = Some(threads);
        }
        options.validate()?;
        Ok(options)
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let mut options = cli.engine_options()?;
    if let Command::Calibrate {
        cache: Some(path), ..
    } = &cli.command
    {
        options.calibration_cache = Some(path.clone());
    }
    let mut engine = Engine::new(options)?;

    match cli.command {
        Command::Backends => {
            let infos: Vec<_> = engine.backends().iter().map(|b| b.info().clone()).collect();
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        Command::Rand { sample, min, max } => {
            let draws = engine.rand(sample.request(), min, max)?;
            println!("{}", matrix_json(&draws)?);
        }
        Command::Randn { sample, mean, std } => {
            let draws = engine.randn(sample.request(), mean, std)?;
            println!("{}", matrix_json(&draws)?);
        }
        Command::Calibrate {
            instances, samples, ..
        } => {
            let sampler = engine.routine("uniform_sampler", samples)?;
            let inputs: KernelInputs = [
                ("min_val".to_string(), Input::Scalar(0.0)),
                ("max_val".to_string(), Input::Scalar(1.0)),
                (
                    "samples".to_string(),
                    KernelData::zeros(&[instances, samples], ElementType::Float).into(),
                ),
                (
                    RNG_STATE.to_string(),
                    KernelData::read_only(seed_table(instances, Some(0))).into(),
                ),
            ]
            .into_iter()
            .collect();
            let weights = engine.calibrate(&sampler, &inputs, Precision::Single)?;
            info!(instances, samples, "calibration finished");

            let report: Vec<_> = engine
                .backends()
                .iter()
                .zip(&weights)
                .map(|(backend, weight)| json!({ "backend": backend.name(), "weight": weight }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn matrix_json(buffer: &HostBuffer) -> Result<String> {
    let values = buffer.to_f64();
    let rows: Vec<Vec<f64>> = values
        .outer_iter()
        .map(|row| row.iter().copied().collect())
        .collect();
    Ok(serde_json::to_string(&rows)?)
}
