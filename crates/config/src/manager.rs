//! Configuration manager implementation
//!
//! Layers built-in defaults, an optional TOML file and `ENGINE_PIPELINE__*`
//! environment variables, then validates the merged result.

use std::path::Path;
use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use common::error::{Error, Result};
use crate::defaults::ENV_PREFIX;
use crate::schema::PipelineConfig;
use crate::validation::ConfigValidator;

/// Configuration manager
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Merged configuration
    config: PipelineConfig,
}

impl ConfigManager {
    /// Creates a configuration manager from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::defaults_json()?;
        let mut builder =
            Config::builder().add_source(File::from_str(&defaults, FileFormat::Json));

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = Self::finish(builder.build())?;
        debug!("Configuration loaded: {:?}", config);

        Ok(Self { config })
    }

    /// Creates a configuration manager from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let defaults = Self::defaults_json()?;
        let built = Config::builder()
            .add_source(File::from_str(&defaults, FileFormat::Json))
            .add_source(File::from_str(text, FileFormat::Toml))
            .build();

        Ok(Self {
            config: Self::finish(built)?,
        })
    }

    /// Returns the merged configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns a mutable reference for command-line overrides
    ///
    /// Callers must run [`ConfigManager::revalidate`] after editing.
    pub fn config_mut(&mut self) -> &mut PipelineConfig {
        &mut self.config
    }

    /// Validates the configuration again after overrides were applied
    pub fn revalidate(&self) -> Result<()> {
        ConfigValidator::validate(&self.config)
    }

    /// Consumes the manager and returns the configuration
    pub fn into_config(self) -> PipelineConfig {
        self.config
    }

    fn defaults_json() -> Result<String> {
        Ok(serde_json::to_string(&PipelineConfig::default())?)
    }

    fn finish(built: std::result::Result<Config, config::ConfigError>) -> Result<PipelineConfig> {
        let config: PipelineConfig = built
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }
}
