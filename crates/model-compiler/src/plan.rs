//! Optimized execution plan
//!
//! The builder lowers a [`NetworkDefinition`](crate::network::NetworkDefinition)
//! into a flat list of kernels over numbered tensor slots. The plan is what
//! gets serialized into an engine blob, so every type here is serde-visible.

use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::types::{DataType, Dims};

/// Where a kernel runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// General-purpose processor
    General,

    /// Fixed-function accelerator core
    Core(u32),
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placement::General => write!(f, "general"),
            Placement::Core(index) => write!(f, "core:{}", index),
        }
    }
}

/// One elementwise step of a fused pointwise kernel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PointwiseStep {
    Scale { scale: f32, shift: f32 },
    Relu,
    LeakyRelu { alpha: f32 },
    Sigmoid,
    Tanh,
}

impl PointwiseStep {
    /// Applies the step to one value
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            PointwiseStep::Scale { scale, shift } => x * scale + shift,
            PointwiseStep::Relu => x.max(0.0),
            PointwiseStep::LeakyRelu { alpha } => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            PointwiseStep::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            PointwiseStep::Tanh => x.tanh(),
        }
    }
}

/// Kernel operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelOp {
    /// Elementwise chain; an empty chain is a copy
    Pointwise { steps: Vec<PointwiseStep> },

    /// Elementwise sum of two tensors
    Add,

    /// Fully connected over the innermost dimension
    Dense {
        in_features: usize,
        out_features: usize,
        weights: Vec<f32>,
        bias: Option<Vec<f32>>,
    },

    /// Softmax over rows of `row_len`
    Softmax { row_len: usize },
}

impl KernelOp {
    /// Short name for layer listings
    pub fn kind(&self) -> &'static str {
        match self {
            KernelOp::Pointwise { steps } if steps.is_empty() => "copy",
            KernelOp::Pointwise { .. } => "pointwise",
            KernelOp::Add => "add",
            KernelOp::Dense { .. } => "dense",
            KernelOp::Softmax { .. } => "softmax",
        }
    }

    /// Number of tensor inputs
    pub fn arity(&self) -> usize {
        match self {
            KernelOp::Add => 2,
            _ => 1,
        }
    }

    /// Whether the kernel can write its output while reading its input
    /// element by element
    pub fn in_place(&self) -> bool {
        matches!(self, KernelOp::Pointwise { .. } | KernelOp::Add)
    }
}

/// One launchable kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Layer name, derived from the fused node names
    pub name: String,

    /// Operation
    pub op: KernelOp,

    /// Input tensor slots
    pub inputs: Vec<usize>,

    /// Output tensor slot
    pub output: usize,

    /// Where the kernel runs
    pub placement: Placement,
}

/// Complete plan for one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Per-sample dims of each tensor slot
    pub tensors: Vec<Dims>,

    /// Slots fed from input bindings, in binding order
    pub input_tensors: Vec<usize>,

    /// Slots copied to output bindings, in binding order
    pub output_tensors: Vec<usize>,

    /// Kernels in execution order
    pub kernels: Vec<Kernel>,
}

impl ExecutionPlan {
    /// Checks the plan is self-consistent
    ///
    /// Every slot referenced exists, is written before it is read, and is
    /// written at most once. Shapes agree with each kernel's operation.
    /// Plans decoded from untrusted bytes must pass this before use.
    pub fn validate(&self) -> Result<()> {
        let slot_count = self.tensors.len();
        let mut written = vec![false; slot_count];

        let check_slot = |slot: usize, what: &str| -> Result<()> {
            if slot >= slot_count {
                return Err(Error::Internal(format!(
                    "{} refers to tensor slot {} of {}",
                    what, slot, slot_count
                )));
            }
            Ok(())
        };

        if self.input_tensors.is_empty() || self.output_tensors.is_empty() {
            return Err(Error::Internal("plan has no inputs or no outputs".to_string()));
        }

        for slot in &self.input_tensors {
            check_slot(*slot, "input binding")?;
            if written[*slot] {
                return Err(Error::Internal(format!("input slot {} bound twice", slot)));
            }
            written[*slot] = true;
        }

        for dims in &self.tensors {
            let addressable = dims.checked_byte_size(DataType::Float32, 1).is_some();
            if dims.rank() == 0 || dims.as_slice().contains(&0) || !addressable {
                return Err(Error::Internal(format!("tensor slot has invalid dims {}", dims)));
            }
        }

        for kernel in &self.kernels {
            if kernel.inputs.len() != kernel.op.arity() {
                return Err(Error::Internal(format!(
                    "kernel '{}' has {} inputs, expected {}",
                    kernel.name,
                    kernel.inputs.len(),
                    kernel.op.arity()
                )));
            }

            for input in &kernel.inputs {
                check_slot(*input, &kernel.name)?;
                if !written[*input] {
                    return Err(Error::Internal(format!(
                        "kernel '{}' reads slot {} before it is written",
                        kernel.name, input
                    )));
                }
            }

            check_slot(kernel.output, &kernel.name)?;
            if written[kernel.output] {
                return Err(Error::Internal(format!(
                    "kernel '{}' overwrites slot {}",
                    kernel.name, kernel.output
                )));
            }

            self.check_shapes(kernel)?;
            written[kernel.output] = true;
        }

        for slot in &self.output_tensors {
            check_slot(*slot, "output binding")?;
            if !written[*slot] || self.input_tensors.contains(slot) {
                return Err(Error::Internal(format!(
                    "output slot {} is not produced by a kernel",
                    slot
                )));
            }
        }

        Ok(())
    }

    fn check_shapes(&self, kernel: &Kernel) -> Result<()> {
        let input = &self.tensors[kernel.inputs[0]];
        let output = &self.tensors[kernel.output];

        let consistent = match &kernel.op {
            KernelOp::Pointwise { .. } => input.element_count() == output.element_count(),
            KernelOp::Add => {
                let other = &self.tensors[kernel.inputs[1]];
                input == other && input.element_count() == output.element_count()
            }
            KernelOp::Dense { in_features, out_features, weights, bias } => {
                input.last() == *in_features
                    && output.last() == *out_features
                    && input.element_count() / in_features == output.element_count() / out_features
                    && in_features.checked_mul(*out_features) == Some(weights.len())
                    && bias.as_ref().map_or(true, |b| b.len() == *out_features)
            }
            KernelOp::Softmax { row_len } => {
                *row_len > 0 && input == output && input.element_count() % row_len == 0
            }
        };

        if !consistent {
            return Err(Error::Internal(format!(
                "kernel '{}' ({}) has inconsistent shapes {} -> {}",
                kernel.name,
                kernel.op.kind(),
                input,
                output
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu_plan() -> ExecutionPlan {
        ExecutionPlan {
            tensors: vec![Dims::from_slice(&[4]), Dims::from_slice(&[4])],
            input_tensors: vec![0],
            output_tensors: vec![1],
            kernels: vec![Kernel {
                name: "act".to_string(),
                op: KernelOp::Pointwise { steps: vec![PointwiseStep::Relu] },
                inputs: vec![0],
                output: 1,
                placement: Placement::General,
            }],
        }
    }

    #[test]
    fn test_pointwise_steps() {
        assert_eq!(PointwiseStep::Relu.apply(-2.0), 0.0);
        assert_eq!(PointwiseStep::LeakyRelu { alpha: 0.1 }.apply(-2.0), -0.2);
        assert_eq!(PointwiseStep::Scale { scale: 2.0, shift: 1.0 }.apply(3.0), 7.0);
        assert_eq!(PointwiseStep::Sigmoid.apply(0.0), 0.5);
    }

    #[test]
    fn test_valid_plan() {
        assert!(relu_plan().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_slot() {
        let mut plan = relu_plan();
        plan.kernels[0].output = 7;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_rejects_read_before_write() {
        let mut plan = relu_plan();
        plan.tensors.push(Dims::from_slice(&[4]));
        plan.kernels[0].inputs = vec![2];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_rejects_output_that_is_an_input() {
        let mut plan = relu_plan();
        plan.output_tensors = vec![0];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_tensors() {
        let mut plan = relu_plan();
        plan.tensors = vec![Dims::from_slice(&[1 << 32, 1 << 32]); 2];
        assert!(plan.validate().is_err());

        let mut plan = relu_plan();
        plan.tensors[1] = Dims::from_slice(&[4, 0]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_rejects_dense_with_wrong_weights() {
        let plan = ExecutionPlan {
            tensors: vec![Dims::from_slice(&[3]), Dims::from_slice(&[2])],
            input_tensors: vec![0],
            output_tensors: vec![1],
            kernels: vec![Kernel {
                name: "fc".to_string(),
                op: KernelOp::Dense {
                    in_features: 3,
                    out_features: 2,
                    weights: vec![0.0; 5],
                    bias: None,
                },
                inputs: vec![0],
                output: 1,
                placement: Placement::General,
            }],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_placement_display() {
        assert_eq!(Placement::General.to_string(), "general");
        assert_eq!(Placement::Core(1).to_string(), "core:1");
    }
}
