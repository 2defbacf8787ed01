//! Engine compilation for the engine pipeline
//!
//! This crate turns a network description found on a search path into a
//! `CompiledEngine`: the file is located, parsed into a shape-checked
//! `NetworkDefinition`, and optimized by the `Builder` into an execution plan
//! for a specific device.

pub mod builder;
pub mod compiler;
pub mod engine;
pub mod kernels;
pub mod locator;
pub mod network;
pub mod parser;
pub mod plan;

// Re-export commonly used types
pub use builder::{BuildConfig, Builder};
pub use compiler::ModelCompiler;
pub use engine::{CompiledEngine, EngineMetadata, LayerInfo};
pub use locator::ModelDescriptor;
pub use network::{NetworkDefinition, Op};
pub use parser::ModelParser;
pub use plan::{ExecutionPlan, Kernel, KernelOp, Placement, PointwiseStep};
