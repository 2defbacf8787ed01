//! Runtime driver for the engine pipeline
//!
//! Runs the whole flow for one configuration: compile the model (or reuse a
//! cached engine blob), deserialize it through a runtime, create one
//! execution context, run the input file through it and write the output
//! file. The synchronous compile and inference work runs on tokio's blocking
//! pool; host file I/O is async.

pub mod io;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use accelerator::Device;
use common::error::Error;
use common::types::{AcceleratorCore, BindingInfo};
use common::utils::{format_bytes, format_duration};
use inference_engine::{Engine, EngineCache, InferenceRequest, Runtime};
use model_compiler::{BuildConfig, ModelCompiler, ModelDescriptor};
use pipeline_config::PipelineConfig;

/// Pipeline stage, for error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Turning settings into a build configuration
    Configure,
    /// Locating, parsing and building the model
    Compile,
    /// Encoding the engine blob or writing it to the cache
    Serialize,
    /// Loading the engine blob through the runtime
    Deserialize,
    /// Creating the execution context
    CreateContext,
    /// Reading the input file
    ReadInput,
    /// Writing the input echo file
    EchoInput,
    /// Running inference
    Infer,
    /// Writing the output file
    WriteOutput,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Compile => "compile",
            Stage::Serialize => "serialize",
            Stage::Deserialize => "deserialize",
            Stage::CreateContext => "create context",
            Stage::ReadInput => "read input",
            Stage::EchoInput => "echo input",
            Stage::Infer => "infer",
            Stage::WriteOutput => "write output",
        };
        f.write_str(name)
    }
}

/// A failed pipeline run
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    /// Stage that failed
    pub stage: Stage,

    /// Underlying error
    #[source]
    pub source: Error,
}

impl PipelineError {
    fn new(stage: Stage, source: Error) -> Self {
        Self { stage, source }
    }
}

trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> StageExt<T> for common::Result<T> {
    fn stage(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError::new(stage, source))
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Engine bindings in binding order
    pub bindings: Vec<BindingInfo>,

    /// Number of optimized layers
    pub num_layers: usize,

    /// True if the engine came from the configured cache file
    pub reused_cached_engine: bool,

    /// Samples per inference call
    pub batch_size: usize,

    /// Inference calls made
    pub iterations: u32,

    /// Mean wall time per call
    pub mean_latency: Duration,

    /// File the output was written to
    pub output_file: PathBuf,

    /// Number of output values written
    pub output_len: usize,
}

/// Runs the pipeline described by `config`
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport, PipelineError> {
    let core = config.build.accelerator_core().stage(Stage::Configure)?;
    let descriptor = ModelDescriptor::from(&config.model);
    let build_config =
        BuildConfig::from_settings(&config.build, descriptor.max_batch_size).stage(Stage::Configure)?;

    let device = Device::from_settings(&config.device);
    let runtime = Runtime::new(device.clone());

    let (engine, reused_cached_engine) = {
        let runtime = runtime.clone();
        let cache_path = config.cache.engine_path.clone();
        let compiler = ModelCompiler::new(device.properties().clone(), build_config);

        blocking(Stage::Compile, move || {
            load_engine(&runtime, &compiler, &descriptor, cache_path, core)
        })
        .await?
    };

    log_engine(&engine);

    let mut context = engine.create_execution_context().stage(Stage::CreateContext)?;
    let sample_len = context.input_binding().element_count();

    let (input, batch_size) =
        io::read_samples(&config.io.input_file, sample_len, engine.max_batch_size())
            .await
            .stage(Stage::ReadInput)?;
    info!(
        "Loaded {} samples from {}",
        batch_size,
        config.io.input_file.display()
    );

    if let Some(echo) = &config.io.echo_file {
        io::write_values(echo, &input).await.stage(Stage::EchoInput)?;
        debug!("Echoed input to {}", echo.display());
    }

    let iterations = config.io.iterations.max(1);
    let (context, output, total) = blocking(Stage::Infer, move || {
        let request = InferenceRequest::new(&input, batch_size);
        let mut output = vec![0.0f32; context.output_len(batch_size)];
        let mut total = Duration::ZERO;

        for _ in 0..iterations {
            total += context.infer_into(&request, &mut output).stage(Stage::Infer)?;
        }
        Ok((context, output, total))
    })
    .await?;

    let mean_latency = total / iterations;
    info!(
        "Ran {} inference iterations, mean {}",
        iterations,
        format_duration(mean_latency)
    );

    io::write_values(&config.io.output_file, &output)
        .await
        .stage(Stage::WriteOutput)?;
    info!(
        "Wrote {} output values to {}",
        output.len(),
        config.io.output_file.display()
    );

    let report = PipelineReport {
        bindings: engine.bindings().to_vec(),
        num_layers: engine.num_layers(),
        reused_cached_engine,
        batch_size,
        iterations,
        mean_latency,
        output_file: config.io.output_file.clone(),
        output_len: output.len(),
    };

    // Context, then engine, then runtime.
    drop(context);
    drop(engine);
    drop(runtime);
    debug!(
        "Released pipeline resources; {} of device memory in use",
        format_bytes(device.memory_usage().used_bytes)
    );

    Ok(report)
}

/// Reuses the cached blob when it deserializes and was built from the
/// current model and settings, otherwise compiles
fn load_engine(
    runtime: &Runtime,
    compiler: &ModelCompiler,
    descriptor: &ModelDescriptor,
    cache_path: Option<PathBuf>,
    core: AcceleratorCore,
) -> Result<(Engine, bool), PipelineError> {
    if let Some(path) = &cache_path {
        let current = compiler.source_fingerprint(descriptor).stage(Stage::Compile)?;

        match EngineCache::load(path).and_then(|blob| runtime.deserialize(&blob, core)) {
            Ok(engine) if engine.compiled().source_fingerprint() == Some(current.as_str()) => {
                info!("Reusing cached engine from {}", path.display());
                return Ok((engine, true));
            }
            Ok(_) => warn!(
                "Cached engine {} was built from another model or build settings; recompiling",
                path.display()
            ),
            Err(e) if e.is_not_found() => debug!("No cached engine at {}", path.display()),
            Err(e) => warn!("Cached engine {} is unusable ({}); recompiling", path.display(), e),
        }
    }

    let compiled = compiler.compile(descriptor).stage(Stage::Compile)?;
    let blob = EngineCache::serialize(&compiled).stage(Stage::Serialize)?;
    drop(compiled);

    if let Some(path) = &cache_path {
        EngineCache::save(&blob, path).stage(Stage::Serialize)?;
    }

    let engine = runtime.deserialize(&blob, core).stage(Stage::Deserialize)?;
    Ok((engine, false))
}

fn log_engine(engine: &Engine) {
    info!("Engine has {} bindings", engine.num_bindings());
    for (index, binding) in engine.bindings().iter().enumerate() {
        info!(
            "  binding {}: {} '{}' {} {}",
            index, binding.role, binding.name, binding.dims, binding.dtype
        );
    }

    info!("Engine has {} layers", engine.num_layers());
    for layer in engine.layers() {
        debug!("  layer '{}' ({}) on {}", layer.name, layer.kind, layer.placement);
    }
}

/// Runs synchronous work on the blocking pool
async fn blocking<T, F>(stage: Stage, work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::new(stage, Error::Internal(format!("worker task failed: {}", e))))?
}
