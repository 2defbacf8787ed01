//! Configuration schema
//!
//! Every section deserializes with defaults so partial files and
//! environment overrides only need to name what they change.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::types::AcceleratorCore;
use crate::defaults::*;

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model location and batch limit
    pub model: ModelSettings,

    /// Optimizer settings
    pub build: BuildSettings,

    /// Accelerator device description
    pub device: DeviceSettings,

    /// Host data files
    pub io: IoSettings,

    /// Engine blob persistence
    pub cache: CacheSettings,

    /// Log output
    pub logging: LoggingSettings,
}

/// Model location settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model file name, resolved against `search_dirs`
    pub file: String,

    /// Candidate directories, first existing match wins
    pub search_dirs: Vec<PathBuf>,

    /// Largest batch the engine accepts
    pub max_batch_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            file: DEFAULT_MODEL_FILE.to_string(),
            search_dirs: default_search_dirs(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Scratch memory budget available to kernels, in bytes
    pub workspace_bytes: u64,

    /// Accelerator core index, `-1` for none
    pub accelerator_core: i32,

    /// Run layers the core cannot execute on the general processor
    pub allow_gpu_fallback: bool,
}

impl BuildSettings {
    /// Returns the typed accelerator core selection
    pub fn accelerator_core(&self) -> Result<AcceleratorCore> {
        AcceleratorCore::from_index(self.accelerator_core).map_err(Error::Config)
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            workspace_bytes: DEFAULT_WORKSPACE_BYTES,
            accelerator_core: DEFAULT_ACCELERATOR_CORE,
            allow_gpu_fallback: true,
        }
    }
}

/// Accelerator device description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device name
    pub name: String,

    /// Compute capability major version
    pub compute_major: u32,

    /// Compute capability minor version
    pub compute_minor: u32,

    /// Device memory capacity in bytes
    pub memory_bytes: u64,

    /// Number of fixed-function accelerator cores
    pub accelerator_cores: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            compute_major: 7,
            compute_minor: 2,
            memory_bytes: DEFAULT_DEVICE_MEMORY_BYTES,
            accelerator_cores: DEFAULT_ACCELERATOR_CORES,
        }
    }
}

/// Host data file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    /// Raw f32 input file
    pub input_file: PathBuf,

    /// Raw f32 output file
    pub output_file: PathBuf,

    /// When set, the loaded input is written back here before inference
    pub echo_file: Option<PathBuf>,

    /// Number of timed inference calls; the last result is written out
    pub iterations: u32,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            input_file: PathBuf::from(DEFAULT_INPUT_FILE),
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
            echo_file: None,
            iterations: 1,
        }
    }
}

/// Engine blob persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Blob file reused across runs; compiled and written when absent or stale
    pub engine_path: Option<PathBuf>,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Renders the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
