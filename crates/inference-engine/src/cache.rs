//! Engine cache: serialization and optional on-disk persistence

use std::fs;
use std::path::Path;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::utils::format_bytes;
use model_compiler::CompiledEngine;
use crate::blob::EngineBlob;

/// Converts compiled engines to and from their blob form
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineCache;

impl EngineCache {
    /// Serializes `engine` into a blob locked to its build device
    pub fn serialize(engine: &CompiledEngine) -> Result<EngineBlob> {
        let payload = serde_json::to_vec(engine)?;
        let blob = EngineBlob::encode(engine.device_fingerprint(), &payload)?;

        debug!(
            "Serialized engine {} into {}",
            engine.id(),
            format_bytes(blob.len() as u64)
        );

        Ok(blob)
    }

    /// Writes a blob to `path`, creating parent directories
    pub fn save(blob: &EngineBlob, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, blob.as_bytes())?;

        info!(
            "Saved engine blob ({}) to {}",
            format_bytes(blob.len() as u64),
            path.display()
        );
        Ok(())
    }

    /// Reads a blob from `path`
    ///
    /// Only the file is read; validation happens when a `Runtime`
    /// deserializes the blob.
    pub fn load(path: &Path) -> Result<EngineBlob> {
        let data = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("engine blob {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;

        let blob = EngineBlob::from_bytes(data);
        if blob.is_empty() {
            return Err(Error::Deserialize(format!("engine blob {} is empty", path.display())));
        }

        debug!(
            "Loaded engine blob ({}) from {}",
            format_bytes(blob.len() as u64),
            path.display()
        );
        Ok(blob)
    }
}
