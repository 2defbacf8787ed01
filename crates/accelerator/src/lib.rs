//! Accelerator device management for the engine pipeline
//!
//! This crate models the accelerator the engines run on: a device with a
//! bounded memory heap and a set of fixed-function accelerator cores,
//! reference-counted device buffers that free themselves exactly once, and
//! ordered asynchronous streams drained by a dedicated worker thread.

pub mod device;
pub mod memory;
pub mod stream;

// Re-export commonly used types
pub use device::{Device, DeviceProperties};
pub use memory::{DeviceBuffer, MemoryUsage};
pub use stream::{KernelArgs, PendingTransfer, Stream};
