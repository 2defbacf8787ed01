use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use engine_pipeline::run_pipeline;
use pipeline_config::ConfigManager;

/// Compile a network into an accelerator engine and run the input through it
#[derive(Parser, Debug)]
#[command(name = "engine-pipeline", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model file name, resolved against the configured search directories
    #[arg(long)]
    model: Option<String>,

    /// Raw little-endian f32 input file
    #[arg(long)]
    input: Option<PathBuf>,

    /// Raw little-endian f32 output file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Accelerator core index, -1 for none
    #[arg(long, allow_hyphen_values = true)]
    accelerator_core: Option<i32>,

    /// Engine blob to reuse, or to write after compiling
    #[arg(long)]
    engine_cache: Option<PathBuf>,

    /// Number of timed inference iterations
    #[arg(long)]
    iterations: Option<u32>,
}

impl Args {
    /// Applies command-line overrides on top of the loaded configuration
    fn apply(self, manager: &mut ConfigManager) -> Result<()> {
        let config = manager.config_mut();
        if let Some(model) = self.model {
            config.model.file = model;
        }
        if let Some(input) = self.input {
            config.io.input_file = input;
        }
        if let Some(output) = self.output {
            config.io.output_file = output;
        }
        if let Some(core) = self.accelerator_core {
            config.build.accelerator_core = core;
        }
        if let Some(path) = self.engine_cache {
            config.cache.engine_path = Some(path);
        }
        if let Some(iterations) = self.iterations {
            config.io.iterations = iterations;
        }

        manager.revalidate().context("invalid command-line options")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut manager = ConfigManager::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut manager)?;
    let config = manager.into_config();

    logging::init(&config.logging).context("failed to initialize logging")?;
    info!("Starting engine pipeline for model {}", config.model.file);

    match run_pipeline(&config).await {
        Ok(report) => {
            info!(
                "Pipeline finished: {} output values written to {} ({} layers, cached engine: {})",
                report.output_len,
                report.output_file.display(),
                report.num_layers,
                report.reused_cached_engine
            );
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}
