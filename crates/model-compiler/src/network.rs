//! Network interchange format and the parsed network graph
//!
//! On disk a network is a JSON document listing its inputs, an ordered node
//! list and the tensors marked as outputs. [`NetworkDefinition`] is the
//! shape-checked graph the parser produces from it.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

use common::types::{DataType, Dims};

/// Interchange format revision understood by the parser
pub const SUPPORTED_OPSET: u32 = 1;

/// Network document as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDocument {
    /// Network name
    #[serde(default)]
    pub name: String,

    /// Format revision
    pub opset: u32,

    /// Network inputs
    pub inputs: Vec<InputDecl>,

    /// Nodes in evaluation order
    #[serde(default)]
    pub nodes: Vec<NodeDecl>,

    /// Tensor names exposed as outputs
    pub outputs: Vec<String>,
}

/// Declared network input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    /// Tensor name
    pub name: String,

    /// Per-sample dimensions
    pub dims: Vec<usize>,

    /// Element type
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    DataType::Float32.to_string()
}

/// Declared node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    /// Node name
    pub name: String,

    /// Operation and its attributes
    #[serde(flatten)]
    pub op: Op,

    /// Input tensor names
    pub inputs: Vec<String>,

    /// Output tensor name
    pub output: String,
}

/// Network operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// y = x
    Identity,

    /// y = x * scale + shift
    Scale {
        scale: f32,
        #[serde(default)]
        shift: f32,
    },

    /// y = max(x, 0)
    Relu,

    /// y = x for x >= 0, alpha * x otherwise
    LeakyRelu { alpha: f32 },

    /// y = 1 / (1 + e^-x)
    Sigmoid,

    /// y = tanh(x)
    Tanh,

    /// y = a + b, identical shapes
    Add,

    /// Fully connected over the innermost dimension.
    /// `weights` is row-major `[out_features, in_features]`.
    Dense {
        out_features: usize,
        weights: Vec<f32>,
        #[serde(default)]
        bias: Option<Vec<f32>>,
    },

    /// Softmax over the innermost dimension
    Softmax,

    /// Reinterprets the element order under new per-sample dims
    Reshape { dims: Vec<usize> },
}

impl Op {
    /// Short operation name for logs and layer listings
    pub fn kind(&self) -> &'static str {
        match self {
            Op::Identity => "identity",
            Op::Scale { .. } => "scale",
            Op::Relu => "relu",
            Op::LeakyRelu { .. } => "leaky_relu",
            Op::Sigmoid => "sigmoid",
            Op::Tanh => "tanh",
            Op::Add => "add",
            Op::Dense { .. } => "dense",
            Op::Softmax => "softmax",
            Op::Reshape { .. } => "reshape",
        }
    }

    /// Number of tensor inputs the operation takes
    pub fn arity(&self) -> usize {
        match self {
            Op::Add => 2,
            _ => 1,
        }
    }
}

/// Tensor in the parsed graph
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDef {
    /// Tensor name
    pub name: String,

    /// Per-sample dims
    pub dims: Dims,

    /// Element type
    pub dtype: DataType,
}

/// Node in the parsed graph; tensors are referenced by index
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node name
    pub name: String,

    /// Operation
    pub op: Op,

    /// Input tensor indices
    pub inputs: Vec<usize>,

    /// Output tensor index
    pub output: usize,
}

/// Shape-checked network graph
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDefinition {
    /// Network name
    pub name: String,

    /// All tensors, inputs first
    pub tensors: Vec<TensorDef>,

    /// Network input tensor indices, in declaration order
    pub inputs: Vec<usize>,

    /// Nodes in evaluation order
    pub nodes: Vec<Node>,

    /// Output tensor indices, in declaration order
    pub outputs: Vec<usize>,
}

impl NetworkDefinition {
    /// Looks a tensor up by name
    pub fn tensor_index(&self, name: &str) -> Option<usize> {
        self.tensors.iter().position(|t| t.name == name)
    }

    /// Number of nodes consuming each tensor, counting output markings
    pub fn consumer_counts(&self) -> HashMap<usize, usize> {
        let mut counts = HashMap::new();
        for node in &self.nodes {
            for input in &node.inputs {
                *counts.entry(*input).or_insert(0) += 1;
            }
        }
        for output in &self.outputs {
            *counts.entry(*output).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_decl_uses_flat_op_tag() {
        let node: NodeDecl = serde_json::from_str(
            r#"{"name": "gain", "op": "scale", "scale": 2.0, "inputs": ["x"], "output": "y"}"#,
        )
        .unwrap();
        assert_eq!(node.op, Op::Scale { scale: 2.0, shift: 0.0 });
        assert_eq!(node.op.kind(), "scale");
    }

    #[test]
    fn test_dense_bias_is_optional() {
        let node: NodeDecl = serde_json::from_str(
            r#"{"name": "fc", "op": "dense", "out_features": 1, "weights": [1.0, 2.0],
                "inputs": ["x"], "output": "y"}"#,
        )
        .unwrap();
        assert!(matches!(node.op, Op::Dense { bias: None, .. }));
    }

    #[test]
    fn test_input_dtype_defaults_to_float32() {
        let input: InputDecl = serde_json::from_str(r#"{"name": "x", "dims": [4]}"#).unwrap();
        assert_eq!(input.dtype, "float32");
    }
}
