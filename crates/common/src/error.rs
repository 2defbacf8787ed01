//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every stage of the
//! compile → cache → execute pipeline.

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// Model file absent from every search directory
    #[error("Not found: {0}")]
    NotFound(String),

    /// The parser rejected the model file
    #[error("Parse error: {0}")]
    Parse(String),

    /// The optimizer could not produce an engine for the given constraints
    #[error("Build error: {0}")]
    Build(String),

    /// Corrupt or incompatible engine blob
    #[error("Deserialize error: {0}")]
    Deserialize(String),

    /// Engine binding contract violated
    #[error("Binding mismatch: {0}")]
    BindingMismatch(String),

    /// Device memory could not be reserved
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Launch or enqueue rejected by the accelerator runtime
    #[error("Execution error: {0}")]
    Execution(String),

    /// Host file read/write failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds an IO error carrying a message instead of an OS error
    pub fn io(message: impl Into<String>) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.into(),
        ))
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if the error is a parse error
    pub fn is_parse(&self) -> bool {
        matches!(self, Error::Parse(_))
    }

    /// Returns true if the error is a build error
    pub fn is_build(&self) -> bool {
        matches!(self, Error::Build(_))
    }

    /// Returns true if the error is a deserialize error
    pub fn is_deserialize(&self) -> bool {
        matches!(self, Error::Deserialize(_))
    }

    /// Returns true if the error is a binding mismatch error
    pub fn is_binding_mismatch(&self) -> bool {
        matches!(self, Error::BindingMismatch(_))
    }

    /// Returns true if the error is a device allocation error
    pub fn is_allocation(&self) -> bool {
        matches!(self, Error::Allocation(_))
    }

    /// Returns true if the error is an execution error
    pub fn is_execution(&self) -> bool {
        matches!(self, Error::Execution(_))
    }

    /// Returns true if the error is a host IO error
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Returns true if the error is an invalid argument error
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_match_variants() {
        assert!(Error::NotFound("model.json".into()).is_not_found());
        assert!(Error::BindingMismatch("3 bindings".into()).is_binding_mismatch());
        assert!(!Error::Build("workspace".into()).is_parse());
        assert!(Error::io("short read").is_io());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_io());
        assert!(err.to_string().starts_with("IO error"));
    }
}
