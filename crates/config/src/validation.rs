//! Configuration validation

use common::error::{Error, Result};
use crate::schema::PipelineConfig;

/// Checks a merged configuration before it is handed to the pipeline
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates every section, reporting the first problem found
    pub fn validate(config: &PipelineConfig) -> Result<()> {
        if config.model.file.trim().is_empty() {
            return Err(Error::Config("model.file must not be empty".to_string()));
        }

        if config.model.search_dirs.is_empty() {
            return Err(Error::Config(
                "model.search_dirs must list at least one directory".to_string(),
            ));
        }

        if config.model.max_batch_size == 0 {
            return Err(Error::Config("model.max_batch_size must be at least 1".to_string()));
        }

        if config.build.workspace_bytes == 0 {
            return Err(Error::Config("build.workspace_bytes must be positive".to_string()));
        }

        if config.build.accelerator_core < -1 {
            return Err(Error::Config(format!(
                "build.accelerator_core must be -1 or a core index, got {}",
                config.build.accelerator_core
            )));
        }

        if config.device.memory_bytes == 0 {
            return Err(Error::Config("device.memory_bytes must be positive".to_string()));
        }

        if config.io.iterations == 0 {
            return Err(Error::Config("io.iterations must be at least 1".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes() {
        assert!(ConfigValidator::validate(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_bad_core_index() {
        let mut config = PipelineConfig::default();
        config.build.accelerator_core = -3;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_rejects_empty_search_path() {
        let mut config = PipelineConfig::default();
        config.model.search_dirs.clear();
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
