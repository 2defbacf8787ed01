//! Default configuration values

use std::path::PathBuf;

/// Model file compiled when none is given
pub const DEFAULT_MODEL_FILE: &str = "beamformer_v7.json";

/// Directories searched, in order, for the model file
pub fn default_search_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("data/samples/beamformer/"),
        PathBuf::from("data/beamformer/"),
    ]
}

/// Largest batch the engine is built for
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1;

/// Builder scratch budget (1 MiB)
pub const DEFAULT_WORKSPACE_BYTES: u64 = 1 << 20;

/// `-1` selects no accelerator core
pub const DEFAULT_ACCELERATOR_CORE: i32 = -1;

/// Device name reported in engine fingerprints
pub const DEFAULT_DEVICE_NAME: &str = "sim-accel";

/// Device memory (512 MiB)
pub const DEFAULT_DEVICE_MEMORY_BYTES: u64 = 512 << 20;

/// Number of fixed-function accelerator cores on the device
pub const DEFAULT_ACCELERATOR_CORES: u32 = 2;

/// Host input file
pub const DEFAULT_INPUT_FILE: &str = "Ireference_tran.bin";

/// Host output file
pub const DEFAULT_OUTPUT_FILE: &str = "beamformed_data.bin";

/// Default log filter
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Prefix of environment overrides, e.g. `ENGINE_PIPELINE__BUILD__WORKSPACE_BYTES`
pub const ENV_PREFIX: &str = "ENGINE_PIPELINE";
