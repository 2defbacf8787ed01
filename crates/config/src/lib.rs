//! Configuration management for the engine pipeline
//!
//! This crate provides the explicit configuration object that is passed into
//! compilation, deserialization and execution, loaded from layered sources.

pub mod defaults;
pub mod manager;
pub mod schema;
pub mod validation;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use schema::{
    BuildSettings, CacheSettings, DeviceSettings, IoSettings, LoggingSettings, ModelSettings,
    PipelineConfig,
};
pub use validation::ConfigValidator;
