//! Common types for the engine pipeline
//!
//! This module defines the tensor and binding descriptors shared by the
//! compiler, the engine cache and the execution context.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Element datatype of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit IEEE float
    Float32,
    /// 16-bit IEEE float
    Float16,
    /// 32-bit signed integer
    Int32,
    /// 8-bit signed integer
    Int8,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 => 2,
            DataType::Int8 => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float32 => write!(f, "float32"),
            DataType::Float16 => write!(f, "float16"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Int8 => write!(f, "int8"),
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" | "float" => Ok(DataType::Float32),
            "float16" | "f16" | "half" => Ok(DataType::Float16),
            "int32" | "i32" => Ok(DataType::Int32),
            "int8" | "i8" => Ok(DataType::Int8),
            _ => Err(format!("Unknown datatype: {}", s)),
        }
    }
}

/// Role of an engine binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingRole {
    /// Host data is copied into this binding before launch
    Input,
    /// Results are copied out of this binding after launch
    Output,
}

impl fmt::Display for BindingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingRole::Input => write!(f, "Input"),
            BindingRole::Output => write!(f, "Output"),
        }
    }
}

/// Per-sample tensor dimensions; the batch dimension is implicit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dims(pub Vec<usize>);

impl Dims {
    /// Creates dims from a slice
    pub fn from_slice(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements in one sample
    ///
    /// Callers must have checked the dims with
    /// [`checked_element_count`](Self::checked_element_count) first.
    pub fn element_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Number of elements in one sample, or `None` if it overflows `usize`
    pub fn checked_element_count(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }

    /// Bytes needed for `batch_size` samples of `dtype`, or `None` on overflow
    pub fn checked_byte_size(&self, dtype: DataType, batch_size: usize) -> Option<usize> {
        self.checked_element_count()?
            .checked_mul(dtype.size_in_bytes())?
            .checked_mul(batch_size)
    }

    /// Size of the innermost dimension, or 1 for scalars
    pub fn last(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Returns the raw dimension slice
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", parts.join("x"))
    }
}

/// Descriptor of one engine binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    /// Tensor name
    pub name: String,
    /// Input or output
    pub role: BindingRole,
    /// Per-sample dimensions
    pub dims: Dims,
    /// Element datatype
    pub dtype: DataType,
}

impl BindingInfo {
    /// Number of elements in one sample
    pub fn element_count(&self) -> usize {
        self.dims.element_count()
    }

    /// Byte size of this binding for a given batch
    pub fn byte_size(&self, batch_size: usize) -> usize {
        batch_size * self.element_count() * self.dtype.size_in_bytes()
    }
}

/// Accelerator core selection
///
/// `None` runs on the general-purpose processor; `Some(index)` targets one
/// of the device's fixed-function cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceleratorCore(pub Option<u32>);

impl AcceleratorCore {
    /// No specific core
    pub const NONE: AcceleratorCore = AcceleratorCore(None);

    /// Converts the command-line convention (`-1` = none) into a selection
    pub fn from_index(index: i32) -> Result<Self, String> {
        match index {
            -1 => Ok(AcceleratorCore(None)),
            i if i >= 0 => Ok(AcceleratorCore(Some(i as u32))),
            i => Err(format!("Invalid accelerator core index: {}", i)),
        }
    }

    /// Returns the selected core index, if any
    pub fn index(&self) -> Option<u32> {
        self.0
    }

    /// Returns true if a specific core is selected
    pub fn is_selected(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Display for AcceleratorCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(index) => write!(f, "core:{}", index),
            None => write!(f, "general"),
        }
    }
}
