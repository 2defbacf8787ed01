//! Model compiler
//!
//! Ties location, parsing and building together. The model file is resolved
//! before any parser or builder exists, so a missing model costs nothing.
//!
//! Every engine is tagged with a source fingerprint: the SHA-256 of the model
//! bytes together with the device and each build setting. A cached engine is
//! only current while its fingerprint matches the model on disk.

use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

use accelerator::DeviceProperties;
use common::error::{Error, Result};
use common::utils::{format_duration, measure_execution_time};
use crate::builder::{BuildConfig, Builder};
use crate::engine::CompiledEngine;
use crate::locator::ModelDescriptor;
use crate::parser::ModelParser;

/// Compiles model files into engines for one device
#[derive(Debug, Clone)]
pub struct ModelCompiler {
    /// Target device
    device: DeviceProperties,

    /// Build configuration; the batch limit comes from each descriptor
    config: BuildConfig,
}

impl ModelCompiler {
    /// Creates a compiler
    pub fn new(device: DeviceProperties, config: BuildConfig) -> Self {
        Self { device, config }
    }

    /// Locates, parses and builds the model named by `descriptor`
    pub fn compile(&self, descriptor: &ModelDescriptor) -> Result<CompiledEngine> {
        let path = descriptor.locate()?;

        let (engine, elapsed) = measure_execution_time(|| {
            let source = read_source(&path)?;
            let network = ModelParser::new().parse_source(&path, &source)?;
            Builder::new(self.device.clone(), self.config.clone())
                .with_max_batch_size(descriptor.max_batch_size)
                .with_source_fingerprint(self.fingerprint(&source, descriptor.max_batch_size))
                .build(&network)
        })?;

        info!(
            "Compiled {} into engine {} in {}",
            path.display(),
            engine.id(),
            format_duration(elapsed)
        );

        Ok(engine)
    }

    /// Fingerprint an engine compiled from `descriptor` right now would carry
    pub fn source_fingerprint(&self, descriptor: &ModelDescriptor) -> Result<String> {
        let path = descriptor.locate()?;
        let source = read_source(&path)?;
        Ok(self.fingerprint(&source, descriptor.max_batch_size))
    }

    fn fingerprint(&self, source: &[u8], max_batch_size: usize) -> String {
        let settings = format!(
            "{}|batch={}|workspace={}|{}|fallback={}",
            self.device.fingerprint(),
            max_batch_size,
            self.config.workspace_bytes,
            self.config.accelerator_core,
            self.config.allow_gpu_fallback
        );

        let mut hasher = Sha256::new();
        hasher.update(source);
        hasher.update([0u8]);
        hasher.update(settings.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read {}: {}", path.display(), e),
        ))
    })
}
