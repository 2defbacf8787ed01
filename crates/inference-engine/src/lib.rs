//! Engine cache and inference execution for the engine pipeline
//!
//! This crate serializes compiled engines into device-locked blobs, loads
//! them back through a long-lived `Runtime`, and runs fixed-shape inference
//! through an `ExecutionContext` that owns one accelerator stream.

pub mod blob;
pub mod cache;
pub mod context;
pub mod runtime;

// Re-export commonly used types
pub use blob::{BlobHeader, EngineBlob, BLOB_MAGIC, BLOB_VERSION};
pub use cache::EngineCache;
pub use context::{ExecutionContext, InferenceRequest, InferenceResult};
pub use runtime::{Engine, Runtime};
