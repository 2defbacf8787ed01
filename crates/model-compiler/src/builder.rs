//! Engine builder
//!
//! Turns a parsed network into a [`CompiledEngine`] for one device. The
//! optimizer runs these passes in order:
//!
//! 1. dead node elimination (nodes that no marked output depends on),
//! 2. lowering of network nodes to plan kernels,
//! 3. pointwise fusion with constant folding of adjacent scale steps,
//! 4. tensor slot compaction,
//! 5. placement on the selected accelerator core, with optional fallback,
//! 6. workspace sizing against the configured budget.

use std::collections::{HashMap, HashSet};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use accelerator::DeviceProperties;
use common::error::{Error, Result};
use common::types::{AcceleratorCore, BindingInfo, BindingRole, DataType, Dims};
use common::utils::format_bytes;
use pipeline_config::BuildSettings;
use crate::engine::{CompiledEngine, EngineMetadata, LayerInfo};
use crate::network::{NetworkDefinition, Op};
use crate::plan::{ExecutionPlan, Kernel, KernelOp, Placement, PointwiseStep};

/// Explicit builder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    /// Largest batch the engine accepts
    pub max_batch_size: usize,

    /// Scratch memory budget in bytes
    pub workspace_bytes: u64,

    /// Accelerator core to place kernels on
    pub accelerator_core: AcceleratorCore,

    /// Run kernels the core cannot execute on the general processor instead
    pub allow_gpu_fallback: bool,
}

impl BuildConfig {
    /// Builds the configuration from settings
    pub fn from_settings(settings: &BuildSettings, max_batch_size: usize) -> Result<Self> {
        Ok(Self {
            max_batch_size,
            workspace_bytes: settings.workspace_bytes,
            accelerator_core: settings.accelerator_core()?,
            allow_gpu_fallback: settings.allow_gpu_fallback,
        })
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            workspace_bytes: 1 << 20,
            accelerator_core: AcceleratorCore::NONE,
            allow_gpu_fallback: true,
        }
    }
}

/// Optimizing engine builder for one device
#[derive(Debug, Clone)]
pub struct Builder {
    /// Target device
    device: DeviceProperties,

    /// Build configuration
    config: BuildConfig,

    /// Recorded in the engine metadata
    source_fingerprint: Option<String>,
}

impl Builder {
    /// Creates a builder targeting `device`
    pub fn new(device: DeviceProperties, config: BuildConfig) -> Self {
        Self {
            device,
            config,
            source_fingerprint: None,
        }
    }

    /// Tags built engines with the fingerprint of their model source
    pub fn with_source_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.source_fingerprint = Some(fingerprint.into());
        self
    }

    /// Overrides the maximum batch size
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.config.max_batch_size = max_batch_size;
        self
    }

    /// Returns the build configuration
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Builds an engine for `network`
    pub fn build(&self, network: &NetworkDefinition) -> Result<CompiledEngine> {
        self.check_config()?;

        info!(
            "Building engine for '{}' on {} (max batch {}, {})",
            network.name,
            self.device.name,
            self.config.max_batch_size,
            self.config.accelerator_core
        );

        let live = Self::live_nodes(network);
        if live.len() < network.nodes.len() {
            debug!(
                "Eliminated {} dead nodes",
                network.nodes.len() - live.len()
            );
        }

        let lowered = Self::lower(network, &live);
        let lowered_count = lowered.len();
        let fused = Self::fuse(network, lowered);
        if fused.len() < lowered_count {
            debug!("Fused {} kernels into {}", lowered_count, fused.len());
        }

        let mut plan = Self::compact(network, fused);
        self.place(&mut plan)?;
        let workspace = self.size_workspace(&plan)?;

        plan.validate()
            .map_err(|e| Error::Build(format!("optimizer produced an invalid plan: {}", e)))?;

        let bindings = Self::bindings(network);
        for binding in &bindings {
            if binding.dims.checked_byte_size(binding.dtype, self.config.max_batch_size).is_none() {
                return Err(Error::Build(format!(
                    "binding '{}' {} at batch {} does not fit in memory",
                    binding.name, binding.dims, self.config.max_batch_size
                )));
            }
        }
        let layers = plan
            .kernels
            .iter()
            .map(|k| LayerInfo {
                name: k.name.clone(),
                kind: k.op.kind().to_string(),
                placement: k.placement,
            })
            .collect::<Vec<_>>();

        let metadata = EngineMetadata {
            id: Uuid::new_v4(),
            name: network.name.clone(),
            built_at: Utc::now(),
            device_fingerprint: self.device.fingerprint(),
            max_batch_size: self.config.max_batch_size,
            bindings,
            layers,
            workspace_bytes: workspace,
            core: self.config.accelerator_core,
            source_fingerprint: self.source_fingerprint.clone(),
        };

        info!(
            "Built engine {}: {} bindings, {} layers, workspace {}",
            metadata.id,
            metadata.bindings.len(),
            metadata.layers.len(),
            format_bytes(workspace)
        );

        CompiledEngine::new(metadata, plan)
    }

    fn check_config(&self) -> Result<()> {
        if self.config.max_batch_size == 0 {
            return Err(Error::Build("max batch size must be at least 1".to_string()));
        }

        if let Some(core) = self.config.accelerator_core.index() {
            if core >= self.device.accelerator_cores {
                return Err(Error::Build(format!(
                    "accelerator core {} requested but {} has {} cores",
                    core, self.device.name, self.device.accelerator_cores
                )));
            }
        }
        Ok(())
    }

    /// Indices of nodes some marked output depends on
    fn live_nodes(network: &NetworkDefinition) -> Vec<usize> {
        let mut needed: HashSet<usize> = network.outputs.iter().copied().collect();
        let mut live = Vec::new();

        for (index, node) in network.nodes.iter().enumerate().rev() {
            if needed.contains(&node.output) {
                needed.extend(node.inputs.iter().copied());
                live.push(index);
            }
        }

        live.reverse();
        live
    }

    fn lower(network: &NetworkDefinition, live: &[usize]) -> Vec<Kernel> {
        live.iter()
            .map(|&index| {
                let node = &network.nodes[index];
                let input_dims = &network.tensors[node.inputs[0]].dims;

                let op = match &node.op {
                    Op::Identity | Op::Reshape { .. } => KernelOp::Pointwise { steps: Vec::new() },
                    Op::Scale { scale, shift } => KernelOp::Pointwise {
                        steps: vec![PointwiseStep::Scale { scale: *scale, shift: *shift }],
                    },
                    Op::Relu => KernelOp::Pointwise { steps: vec![PointwiseStep::Relu] },
                    Op::LeakyRelu { alpha } => KernelOp::Pointwise {
                        steps: vec![PointwiseStep::LeakyRelu { alpha: *alpha }],
                    },
                    Op::Sigmoid => KernelOp::Pointwise { steps: vec![PointwiseStep::Sigmoid] },
                    Op::Tanh => KernelOp::Pointwise { steps: vec![PointwiseStep::Tanh] },
                    Op::Add => KernelOp::Add,
                    Op::Dense { out_features, weights, bias } => KernelOp::Dense {
                        in_features: input_dims.last(),
                        out_features: *out_features,
                        weights: weights.clone(),
                        bias: bias.clone(),
                    },
                    Op::Softmax => KernelOp::Softmax { row_len: input_dims.last() },
                };

                Kernel {
                    name: node.name.clone(),
                    op,
                    inputs: node.inputs.clone(),
                    output: node.output,
                    placement: Placement::General,
                }
            })
            .collect()
    }

    /// Merges pointwise kernels into their pointwise producer when the
    /// intermediate tensor has exactly one consumer and is not an output
    fn fuse(network: &NetworkDefinition, kernels: Vec<Kernel>) -> Vec<Kernel> {
        let mut consumers: HashMap<usize, usize> = HashMap::new();
        for kernel in &kernels {
            for input in &kernel.inputs {
                *consumers.entry(*input).or_insert(0) += 1;
            }
        }
        for output in &network.outputs {
            *consumers.entry(*output).or_insert(0) += 1;
        }

        let mut fused: Vec<Kernel> = Vec::with_capacity(kernels.len());
        let mut producer: HashMap<usize, usize> = HashMap::new();

        for kernel in kernels {
            let target = match &kernel.op {
                KernelOp::Pointwise { .. } => {
                    let input = kernel.inputs[0];
                    producer.get(&input).copied().filter(|&index| {
                        matches!(fused[index].op, KernelOp::Pointwise { .. })
                            && consumers.get(&input).copied() == Some(1)
                    })
                }
                _ => None,
            };

            match (target, kernel.op) {
                (Some(index), KernelOp::Pointwise { steps }) => {
                    let head = &mut fused[index];
                    if let KernelOp::Pointwise { steps: head_steps } = &mut head.op {
                        head_steps.extend(steps);
                    }
                    head.name = format!("{}+{}", head.name, kernel.name);
                    head.output = kernel.output;
                    producer.insert(kernel.output, index);
                }
                (_, op) => {
                    producer.insert(kernel.output, fused.len());
                    fused.push(Kernel { op, ..kernel });
                }
            }
        }

        for kernel in &mut fused {
            if let KernelOp::Pointwise { steps } = &mut kernel.op {
                *steps = Self::fold_steps(std::mem::take(steps));
            }
        }

        fused
    }

    /// Folds adjacent scale steps and drops scale steps that do nothing
    fn fold_steps(steps: Vec<PointwiseStep>) -> Vec<PointwiseStep> {
        let mut folded: Vec<PointwiseStep> = Vec::with_capacity(steps.len());

        for step in steps {
            match (folded.last_mut(), step) {
                (
                    Some(PointwiseStep::Scale { scale: a, shift: b }),
                    PointwiseStep::Scale { scale: c, shift: d },
                ) => {
                    // (x * a + b) * c + d
                    *b = *b * c + d;
                    *a *= c;
                }
                (_, step) => folded.push(step),
            }
        }

        folded.retain(|step| *step != PointwiseStep::Scale { scale: 1.0, shift: 0.0 });
        folded
    }

    /// Renumbers tensor slots so only tensors the plan touches remain
    fn compact(network: &NetworkDefinition, mut kernels: Vec<Kernel>) -> ExecutionPlan {
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut tensors: Vec<Dims> = Vec::new();

        let mut slot = |tensor: usize| -> usize {
            *remap.entry(tensor).or_insert_with(|| {
                tensors.push(network.tensors[tensor].dims.clone());
                tensors.len() - 1
            })
        };

        let input_tensors = network.inputs.iter().map(|t| slot(*t)).collect();
        for kernel in &mut kernels {
            kernel.inputs = kernel.inputs.iter().map(|t| slot(*t)).collect();
            kernel.output = slot(kernel.output);
        }
        let output_tensors = network.outputs.iter().map(|t| slot(*t)).collect();

        ExecutionPlan {
            tensors,
            input_tensors,
            output_tensors,
            kernels,
        }
    }

    fn place(&self, plan: &mut ExecutionPlan) -> Result<()> {
        let core = match self.config.accelerator_core.index() {
            Some(core) => core,
            None => return Ok(()),
        };

        for kernel in &mut plan.kernels {
            if Self::core_supports(&kernel.op) {
                kernel.placement = Placement::Core(core);
            } else if self.config.allow_gpu_fallback {
                warn!(
                    "Layer '{}' ({}) is not supported on accelerator core {}, falling back to the general processor",
                    kernel.name,
                    kernel.op.kind(),
                    core
                );
                kernel.placement = Placement::General;
            } else {
                return Err(Error::Build(format!(
                    "layer '{}' ({}) is not supported on accelerator core {} and fallback is disabled",
                    kernel.name,
                    kernel.op.kind(),
                    core
                )));
            }
        }
        Ok(())
    }

    /// Accelerator cores have no exponent unit wide enough for softmax
    fn core_supports(op: &KernelOp) -> bool {
        !matches!(op, KernelOp::Softmax { .. })
    }

    /// Largest scratch need of any kernel that cannot run in place
    fn size_workspace(&self, plan: &ExecutionPlan) -> Result<u64> {
        let mut required = 0u64;

        for kernel in plan.kernels.iter().filter(|k| !k.op.in_place()) {
            let need = plan.tensors[kernel.output]
                .checked_byte_size(DataType::Float32, self.config.max_batch_size)
                .ok_or_else(|| {
                    Error::Build(format!(
                        "layer '{}' output at batch {} does not fit in memory",
                        kernel.name, self.config.max_batch_size
                    ))
                })? as u64;

            if need > self.config.workspace_bytes {
                return Err(Error::Build(format!(
                    "layer '{}' needs {} of workspace but the budget is {}",
                    kernel.name,
                    format_bytes(need),
                    format_bytes(self.config.workspace_bytes)
                )));
            }
            required = required.max(need);
        }

        Ok(required)
    }

    fn bindings(network: &NetworkDefinition) -> Vec<BindingInfo> {
        let inputs = network.inputs.iter().map(|t| (*t, BindingRole::Input));
        let outputs = network.outputs.iter().map(|t| (*t, BindingRole::Output));

        inputs
            .chain(outputs)
            .map(|(tensor, role)| {
                let def = &network.tensors[tensor];
                BindingInfo {
                    name: def.name.clone(),
                    role,
                    dims: def.dims.clone(),
                    dtype: def.dtype,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ModelParser;
    use serde_json::json;

    fn device(cores: u32) -> DeviceProperties {
        DeviceProperties {
            name: "test-accel".to_string(),
            compute_major: 7,
            compute_minor: 2,
            total_memory: 64 << 20,
            accelerator_cores: cores,
        }
    }

    fn network(value: serde_json::Value) -> NetworkDefinition {
        ModelParser::new().parse_str(&value.to_string()).unwrap()
    }

    fn mlp() -> NetworkDefinition {
        network(json!({
            "name": "mlp",
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "nodes": [
                {"name": "gain", "op": "scale", "scale": 2.0, "inputs": ["x"], "output": "a"},
                {"name": "trim", "op": "scale", "scale": 0.5, "shift": 1.0, "inputs": ["a"], "output": "b"},
                {"name": "act", "op": "relu", "inputs": ["b"], "output": "c"},
                {"name": "fc", "op": "dense", "out_features": 2,
                 "weights": [1, 1, 1, 1, 0, 0, 0, 1], "bias": [0, 1], "inputs": ["c"], "output": "d"},
                {"name": "prob", "op": "softmax", "inputs": ["d"], "output": "y"},
                {"name": "unused", "op": "tanh", "inputs": ["x"], "output": "z"}
            ],
            "outputs": ["y"]
        }))
    }

    #[test]
    fn test_dead_nodes_are_eliminated_and_pointwise_fused() {
        let engine = Builder::new(device(0), BuildConfig::default()).build(&mlp()).unwrap();
        let plan = engine.plan();

        assert_eq!(plan.kernels.len(), 3);
        assert_eq!(plan.kernels[0].name, "gain+trim+act");
        assert!(plan.kernels.iter().all(|k| k.name != "unused"));

        // 2x then 0.5x+1 folds into a single x+1.
        assert_eq!(
            plan.kernels[0].op,
            KernelOp::Pointwise {
                steps: vec![PointwiseStep::Scale { scale: 1.0, shift: 1.0 }, PointwiseStep::Relu]
            }
        );
        assert_eq!(plan.tensors.len(), 4);
    }

    #[test]
    fn test_fusion_stops_at_shared_intermediates() {
        let net = network(json!({
            "opset": 1,
            "inputs": [{"name": "x", "dims": [4]}],
            "nodes": [
                {"name": "s", "op": "sigmoid", "inputs": ["x"], "output": "a"},
                {"name": "r", "op": "relu", "inputs": ["a"], "output": "b"},
                {"name": "sum", "op": "add", "inputs": ["a", "b"], "output": "y"}
            ],
            "outputs": ["y"]
        }));
        let engine = Builder::new(device(0), BuildConfig::default()).build(&net).unwrap();
        assert_eq!(engine.plan().kernels.len(), 3);
    }

    #[test]
    fn test_identity_scales_are_dropped() {
        assert!(Builder::fold_steps(vec![
            PointwiseStep::Scale { scale: 4.0, shift: 0.0 },
            PointwiseStep::Scale { scale: 0.25, shift: 0.0 },
        ])
        .is_empty());
    }

    #[test]
    fn test_bindings_inputs_then_outputs() {
        let engine = Builder::new(device(0), BuildConfig::default()).build(&mlp()).unwrap();
        let bindings = engine.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].role, BindingRole::Input);
        assert_eq!(bindings[0].name, "x");
        assert_eq!(bindings[1].role, BindingRole::Output);
        assert_eq!(bindings[1].dims, Dims::from_slice(&[2]));
    }

    #[test]
    fn test_zero_max_batch_is_build_error() {
        let builder = Builder::new(device(0), BuildConfig::default()).with_max_batch_size(0);
        assert!(builder.build(&mlp()).unwrap_err().is_build());
    }

    #[test]
    fn test_missing_core_is_build_error() {
        let config = BuildConfig {
            accelerator_core: AcceleratorCore(Some(2)),
            ..BuildConfig::default()
        };
        assert!(Builder::new(device(2), config).build(&mlp()).unwrap_err().is_build());
    }

    #[test]
    fn test_core_placement_with_fallback() {
        let config = BuildConfig {
            accelerator_core: AcceleratorCore(Some(1)),
            ..BuildConfig::default()
        };
        let engine = Builder::new(device(2), config).build(&mlp()).unwrap();
        let placements: Vec<Placement> = engine.layers().iter().map(|l| l.placement).collect();
        assert_eq!(
            placements,
            vec![Placement::Core(1), Placement::Core(1), Placement::General]
        );
    }

    #[test]
    fn test_unsupported_layer_without_fallback_is_build_error() {
        let config = BuildConfig {
            accelerator_core: AcceleratorCore(Some(0)),
            allow_gpu_fallback: false,
            ..BuildConfig::default()
        };
        let err = Builder::new(device(1), config).build(&mlp()).unwrap_err();
        assert!(err.is_build());
        assert!(err.to_string().contains("prob"));
    }

    #[test]
    fn test_workspace_budget() {
        let config = BuildConfig {
            workspace_bytes: 8,
            ..BuildConfig::default()
        };
        // Dense and softmax each need 2 elements * 4 bytes.
        let engine = Builder::new(device(0), config.clone()).build(&mlp()).unwrap();
        assert_eq!(engine.metadata().workspace_bytes, 8);

        let err = Builder::new(device(0), config)
            .with_max_batch_size(2)
            .build(&mlp())
            .unwrap_err();
        assert!(err.is_build());
    }

    #[test]
    fn test_batch_size_overflow_is_build_error() {
        for op in ["relu", "softmax"] {
            let network = network(json!({
                "opset": 1,
                "inputs": [{"name": "x", "dims": [usize::MAX / 8]}],
                "nodes": [{"name": "n", "op": op, "inputs": ["x"], "output": "y"}],
                "outputs": ["y"]
            }));
            let config = BuildConfig {
                workspace_bytes: u64::MAX,
                ..BuildConfig::default()
            };

            let err = Builder::new(device(0), config)
                .with_max_batch_size(4)
                .build(&network)
                .unwrap_err();
            assert!(err.is_build(), "{}: {}", op, err);
        }
    }

    #[test]
    fn test_from_settings_rejects_bad_core() {
        let settings = BuildSettings {
            accelerator_core: -3,
            ..BuildSettings::default()
        };
        assert!(BuildConfig::from_settings(&settings, 1).is_err());
    }
}
