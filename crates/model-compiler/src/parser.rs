//! Network parser
//!
//! Reads a network document and checks it into a [`NetworkDefinition`]:
//! every tensor is defined exactly once before use, operation attributes
//! agree with the shapes they act on, and outputs name real, non-input
//! tensors. Every rejection is reported as [`Error::Parse`].

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::types::{DataType, Dims};
use crate::network::{
    NetworkDefinition, NetworkDocument, Node, Op, TensorDef, SUPPORTED_OPSET,
};

/// Parser for network documents
#[derive(Debug, Default)]
pub struct ModelParser {
    /// Tensor name -> index, for the network being parsed
    symbols: HashMap<String, usize>,

    /// Tensors defined so far
    tensors: Vec<TensorDef>,
}

impl ModelParser {
    /// Creates a parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the network stored at `path`
    pub fn parse_file(self, path: &Path) -> Result<NetworkDefinition> {
        let bytes = std::fs::read(path)?;
        self.parse_source(path, &bytes)
    }

    /// Parses `bytes` already read from `path`; parse errors name the path
    pub fn parse_source(self, path: &Path, bytes: &[u8]) -> Result<NetworkDefinition> {
        info!("Parsing network {}", path.display());
        self.parse_slice(bytes).map_err(|e| match e {
            Error::Parse(msg) => Error::Parse(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parses a network document held in memory
    pub fn parse_str(self, text: &str) -> Result<NetworkDefinition> {
        self.parse_slice(text.as_bytes())
    }

    /// Parses raw document bytes; bytes that are not UTF-8 JSON are rejected
    pub fn parse_slice(self, bytes: &[u8]) -> Result<NetworkDefinition> {
        let document: NetworkDocument = serde_json::from_slice(bytes)
            .map_err(|e| Error::Parse(format!("malformed network document: {}", e)))?;
        self.parse_document(document)
    }

    /// Checks an already decoded document
    pub fn parse_document(mut self, document: NetworkDocument) -> Result<NetworkDefinition> {
        if document.opset != SUPPORTED_OPSET {
            return Err(Error::Parse(format!(
                "unsupported opset {} (supported: {})",
                document.opset, SUPPORTED_OPSET
            )));
        }

        if document.inputs.is_empty() {
            return Err(Error::Parse("network declares no inputs".to_string()));
        }

        let mut inputs = Vec::with_capacity(document.inputs.len());
        for decl in &document.inputs {
            let dtype: DataType = decl.dtype.parse().map_err(Error::Parse)?;
            if dtype != DataType::Float32 {
                return Err(Error::Parse(format!(
                    "input '{}' has unsupported datatype {}",
                    decl.name, dtype
                )));
            }
            let dims = Self::check_dims(&decl.name, &decl.dims)?;
            inputs.push(self.define(&decl.name, dims)?);
        }

        let mut nodes = Vec::with_capacity(document.nodes.len());
        for decl in document.nodes {
            if decl.inputs.len() != decl.op.arity() {
                return Err(Error::Parse(format!(
                    "node '{}' ({}) takes {} inputs, got {}",
                    decl.name,
                    decl.op.kind(),
                    decl.op.arity(),
                    decl.inputs.len()
                )));
            }

            let node_inputs = decl
                .inputs
                .iter()
                .map(|name| self.resolve(&decl.name, name))
                .collect::<Result<Vec<_>>>()?;

            let dims = self.infer_dims(&decl.name, &decl.op, &node_inputs)?;
            Self::check_size(&decl.output, &dims)?;
            let output = self.define(&decl.output, dims)?;

            nodes.push(Node {
                name: decl.name,
                op: decl.op,
                inputs: node_inputs,
                output,
            });
        }

        if document.outputs.is_empty() {
            return Err(Error::Parse("network marks no outputs".to_string()));
        }

        let mut outputs = Vec::with_capacity(document.outputs.len());
        for name in &document.outputs {
            let index = *self.symbols.get(name).ok_or_else(|| {
                Error::Parse(format!("output '{}' is not produced by the network", name))
            })?;
            if inputs.contains(&index) {
                return Err(Error::Parse(format!(
                    "network input '{}' cannot also be marked as an output",
                    name
                )));
            }
            if outputs.contains(&index) {
                return Err(Error::Parse(format!("output '{}' is marked twice", name)));
            }
            outputs.push(index);
        }

        let network = NetworkDefinition {
            name: document.name,
            tensors: self.tensors,
            inputs,
            nodes,
            outputs,
        };

        debug!(
            "Parsed network '{}': {} tensors, {} nodes, {} inputs, {} outputs",
            network.name,
            network.tensors.len(),
            network.nodes.len(),
            network.inputs.len(),
            network.outputs.len()
        );

        Ok(network)
    }

    fn check_dims(name: &str, dims: &[usize]) -> Result<Dims> {
        if dims.is_empty() || dims.iter().any(|d| *d == 0) {
            return Err(Error::Parse(format!(
                "tensor '{}' has invalid dims {:?}",
                name, dims
            )));
        }
        let dims = Dims::from_slice(dims);
        Self::check_size(name, &dims)?;
        Ok(dims)
    }

    /// One sample of the tensor must be addressable in bytes
    fn check_size(name: &str, dims: &Dims) -> Result<()> {
        if dims.checked_byte_size(DataType::Float32, 1).is_none() {
            return Err(Error::Parse(format!(
                "tensor '{}' with dims {} is too large",
                name, dims
            )));
        }
        Ok(())
    }

    fn define(&mut self, name: &str, dims: Dims) -> Result<usize> {
        if name.is_empty() {
            return Err(Error::Parse("tensor names must not be empty".to_string()));
        }
        if self.symbols.contains_key(name) {
            return Err(Error::Parse(format!("tensor '{}' is defined twice", name)));
        }

        let index = self.tensors.len();
        self.tensors.push(TensorDef {
            name: name.to_string(),
            dims,
            dtype: DataType::Float32,
        });
        self.symbols.insert(name.to_string(), index);
        Ok(index)
    }

    fn resolve(&self, node: &str, tensor: &str) -> Result<usize> {
        self.symbols.get(tensor).copied().ok_or_else(|| {
            Error::Parse(format!(
                "node '{}' reads tensor '{}' before it is defined",
                node, tensor
            ))
        })
    }

    fn infer_dims(&self, node: &str, op: &Op, inputs: &[usize]) -> Result<Dims> {
        let first = &self.tensors[inputs[0]].dims;

        match op {
            Op::Identity
            | Op::Scale { .. }
            | Op::Relu
            | Op::LeakyRelu { .. }
            | Op::Sigmoid
            | Op::Tanh
            | Op::Softmax => Ok(first.clone()),

            Op::Add => {
                let second = &self.tensors[inputs[1]].dims;
                if first != second {
                    return Err(Error::Parse(format!(
                        "node '{}' adds tensors of different shapes {} and {}",
                        node, first, second
                    )));
                }
                Ok(first.clone())
            }

            Op::Dense { out_features, weights, bias } => {
                let in_features = first.last();
                if *out_features == 0 {
                    return Err(Error::Parse(format!("node '{}' has zero out_features", node)));
                }
                if out_features.checked_mul(in_features) != Some(weights.len()) {
                    return Err(Error::Parse(format!(
                        "node '{}' expects {}x{} weights, got {}",
                        node,
                        out_features,
                        in_features,
                        weights.len()
                    )));
                }
                if let Some(bias) = bias {
                    if bias.len() != *out_features {
                        return Err(Error::Parse(format!(
                            "node '{}' expects {} bias values, got {}",
                            node,
                            out_features,
                            bias.len()
                        )));
                    }
                }

                let mut dims = first.as_slice().to_vec();
                if let Some(last) = dims.last_mut() {
                    *last = *out_features;
                }
                Ok(Dims(dims))
            }

            Op::Reshape { dims } => {
                let target = Self::check_dims(node, dims)?;
                if target.element_count() != first.element_count() {
                    return Err(Error::Parse(format!(
                        "node '{}' reshapes {} into {} with a different element count",
                        node, first, target
                    )));
                }
                Ok(target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<NetworkDefinition> {
        ModelParser::new().parse_str(&value.to_string())
    }

    #[test]
    fn test_parses_chain_with_shapes() {
        let network = parse(json!({
            "name": "chain",
            "opset": 1,
            "inputs": [{"name": "x", "dims": [2, 3]}],
            "nodes": [
                {"name": "fc", "op": "dense", "out_features": 2,
                 "weights": [1, 0, 0, 0, 1, 0], "inputs": ["x"], "output": "h"},
                {"name": "act", "op": "relu", "inputs": ["h"], "output": "y"}
            ],
            "outputs": ["y"]
        }))
        .unwrap();

        assert_eq!(network.tensors.len(), 3);
        let y = network.tensor_index("y").unwrap();
        assert_eq!(network.tensors[y].dims, Dims::from_slice(&[2, 2]));
        assert_eq!(network.outputs, vec![y]);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = ModelParser::new().parse_str("{ not json").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_unknown_op_is_parse_error() {
        let err = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "nodes": [{"name": "n", "op": "conv3d", "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }))
        .unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_undefined_tensor_is_parse_error() {
        let err = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "nodes": [{"name": "n", "op": "relu", "inputs": ["missing"], "output": "y"}],
            "outputs": ["y"]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unsupported_opset_and_dtype() {
        let opset = parse(json!({
            "opset": 9,
            "inputs": [{"name": "x", "dims": [4]}],
            "outputs": []
        }));
        assert!(opset.unwrap_err().is_parse());

        let dtype = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4], "dtype": "int8"}],
            "nodes": [{"name": "n", "op": "relu", "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(dtype.unwrap_err().is_parse());
    }

    #[test]
    fn test_shape_mismatches_are_rejected() {
        let add = parse(json!({
            "opset": 1,
            "inputs": [{"name": "a", "dims": [4]}, {"name": "b", "dims": [5]}],
            "nodes": [{"name": "sum", "op": "add", "inputs": ["a", "b"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(add.unwrap_err().is_parse());

        let reshape = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [2, 3]}],
            "nodes": [{"name": "r", "op": "reshape", "dims": [4], "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(reshape.unwrap_err().is_parse());

        let dense = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [3]}],
            "nodes": [{"name": "fc", "op": "dense", "out_features": 2,
                       "weights": [1, 2, 3], "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(dense.unwrap_err().is_parse());
    }

    #[test]
    fn test_output_rules() {
        let input_as_output = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "outputs": ["x"]
        }));
        assert!(input_as_output.unwrap_err().is_parse());

        let redefined = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "nodes": [{"name": "n", "op": "relu", "inputs": ["x"], "output": "x"}],
            "outputs": ["x"]
        }));
        assert!(redefined.unwrap_err().is_parse());
    }

    #[test]
    fn test_parse_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[]").unwrap();

        let err = ModelParser::new().parse_file(&path).unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn test_binary_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, [0x08, 0xff, 0xfe, 0x12, 0x00]).unwrap();

        let err = ModelParser::new().parse_file(&path).unwrap_err();
        assert!(err.is_parse(), "unexpected error: {}", err);
        assert!(err.to_string().contains("model.json"));

        let missing = ModelParser::new().parse_file(&dir.path().join("absent.json"));
        assert!(missing.unwrap_err().is_io());
    }

    #[test]
    fn test_oversized_dims_are_parse_errors() {
        let input = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4294967296u64, 4294967296u64]}],
            "nodes": [{"name": "sm", "op": "softmax", "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(input.unwrap_err().is_parse());

        let bytes = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [usize::MAX / 2]}],
            "nodes": [{"name": "act", "op": "relu", "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(bytes.unwrap_err().is_parse());

        let reshape = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "nodes": [{"name": "r", "op": "reshape", "dims": [4294967296u64, 4294967296u64, 4],
                       "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(reshape.unwrap_err().is_parse());

        let dense = parse(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4294967296u64]}],
            "nodes": [{"name": "fc", "op": "dense", "out_features": 4294967296u64,
                       "weights": [1], "inputs": ["x"], "output": "y"}],
            "outputs": ["y"]
        }));
        assert!(dense.unwrap_err().is_parse());
    }
}
