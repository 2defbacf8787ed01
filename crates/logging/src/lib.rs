//! Logging for the engine pipeline
//!
//! This crate installs the process tracing subscriber from the explicit
//! logging settings; library crates only emit `tracing` events.

pub mod logger;

// Re-export commonly used types
pub use logger::init;
