//! Compiled engine: execution plan plus binding and layer metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::error::{Error, Result};
use common::types::{AcceleratorCore, BindingInfo, BindingRole};
use crate::kernels;
use crate::plan::{ExecutionPlan, Placement};

/// One optimized layer as reported to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Layer name
    pub name: String,

    /// Kernel kind
    pub kind: String,

    /// Where the layer runs
    pub placement: Placement,
}

/// Engine metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetadata {
    /// Engine id, unique per build
    pub id: Uuid,

    /// Network name
    pub name: String,

    /// Build time
    pub built_at: DateTime<Utc>,

    /// Fingerprint of the device the engine was built for
    pub device_fingerprint: String,

    /// Largest accepted batch
    pub max_batch_size: usize,

    /// Bindings: inputs first, then outputs
    pub bindings: Vec<BindingInfo>,

    /// Optimized layers in execution order
    pub layers: Vec<LayerInfo>,

    /// Workspace the layers need at the maximum batch size
    pub workspace_bytes: u64,

    /// Core the engine was built for
    pub core: AcceleratorCore,

    /// Digest of the model source and build settings, when built from a file
    #[serde(default)]
    pub source_fingerprint: Option<String>,
}

/// Optimized engine for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledEngine {
    metadata: EngineMetadata,
    plan: ExecutionPlan,
}

impl CompiledEngine {
    /// Assembles an engine, checking metadata and plan agree
    pub fn new(metadata: EngineMetadata, plan: ExecutionPlan) -> Result<Self> {
        let engine = Self { metadata, plan };
        engine.validate()?;
        Ok(engine)
    }

    /// Checks the plan and its agreement with the binding table
    ///
    /// Engines decoded from bytes must pass this before they are executed.
    pub fn validate(&self) -> Result<()> {
        self.plan.validate()?;

        if self.metadata.max_batch_size == 0 {
            return Err(Error::Internal("engine max batch size is 0".to_string()));
        }

        let slots = self
            .plan
            .input_tensors
            .iter()
            .map(|s| (*s, BindingRole::Input))
            .chain(self.plan.output_tensors.iter().map(|s| (*s, BindingRole::Output)));

        if self.metadata.bindings.len() != self.plan.input_tensors.len() + self.plan.output_tensors.len() {
            return Err(Error::Internal(format!(
                "engine lists {} bindings but its plan has {}",
                self.metadata.bindings.len(),
                self.plan.input_tensors.len() + self.plan.output_tensors.len()
            )));
        }

        for (binding, (slot, role)) in self.metadata.bindings.iter().zip(slots) {
            if binding.role != role || binding.dims != self.plan.tensors[slot] {
                return Err(Error::Internal(format!(
                    "binding '{}' does not match its plan tensor",
                    binding.name
                )));
            }
            if binding.dims.checked_byte_size(binding.dtype, self.metadata.max_batch_size).is_none() {
                return Err(Error::Internal(format!(
                    "binding '{}' overflows at batch {}",
                    binding.name, self.metadata.max_batch_size
                )));
            }
        }

        if self.metadata.layers.len() != self.plan.kernels.len() {
            return Err(Error::Internal(format!(
                "engine lists {} layers but its plan has {}",
                self.metadata.layers.len(),
                self.plan.kernels.len()
            )));
        }

        Ok(())
    }

    /// Engine metadata
    pub fn metadata(&self) -> &EngineMetadata {
        &self.metadata
    }

    /// Execution plan
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Digest of the model source and build settings the engine came from
    pub fn source_fingerprint(&self) -> Option<&str> {
        self.metadata.source_fingerprint.as_deref()
    }

    /// Engine id
    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    /// Number of bindings
    pub fn num_bindings(&self) -> usize {
        self.metadata.bindings.len()
    }

    /// Binding descriptors in binding order
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.metadata.bindings
    }

    /// Binding descriptor at `index`
    pub fn binding(&self, index: usize) -> Option<&BindingInfo> {
        self.metadata.bindings.get(index)
    }

    /// Number of optimized layers
    pub fn num_layers(&self) -> usize {
        self.metadata.layers.len()
    }

    /// Optimized layers
    pub fn layers(&self) -> &[LayerInfo] {
        &self.metadata.layers
    }

    /// Largest accepted batch
    pub fn max_batch_size(&self) -> usize {
        self.metadata.max_batch_size
    }

    /// Device fingerprint the engine is locked to
    pub fn device_fingerprint(&self) -> &str {
        &self.metadata.device_fingerprint
    }

    /// Returns true if any layer is placed on an accelerator core
    pub fn uses_core(&self) -> bool {
        self.metadata
            .layers
            .iter()
            .any(|l| matches!(l.placement, Placement::Core(_)))
    }

    /// Runs the plan for `batch` samples
    ///
    /// `inputs` and `outputs` are in binding order and hold `batch` samples
    /// each.
    pub fn execute(&self, batch: usize, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        if batch == 0 || batch > self.metadata.max_batch_size {
            return Err(Error::Execution(format!(
                "batch {} outside 1..={}",
                batch, self.metadata.max_batch_size
            )));
        }

        let plan = &self.plan;
        if inputs.len() != plan.input_tensors.len() || outputs.len() != plan.output_tensors.len() {
            return Err(Error::Execution(format!(
                "engine takes {} inputs and {} outputs, got {} and {}",
                plan.input_tensors.len(),
                plan.output_tensors.len(),
                inputs.len(),
                outputs.len()
            )));
        }

        let expected = |slot: usize| batch * plan.tensors[slot].element_count();
        for (data, slot) in inputs.iter().zip(&plan.input_tensors) {
            if data.len() != expected(*slot) {
                return Err(Error::Execution(format!(
                    "input holds {} values, expected {}",
                    data.len(),
                    expected(*slot)
                )));
            }
        }
        for (data, slot) in outputs.iter().zip(&plan.output_tensors) {
            if data.len() != expected(*slot) {
                return Err(Error::Execution(format!(
                    "output holds {} values, expected {}",
                    data.len(),
                    expected(*slot)
                )));
            }
        }

        let mut values: Vec<Vec<f32>> = vec![Vec::new(); plan.tensors.len()];

        for kernel in &plan.kernels {
            let mut result = vec![0.0f32; expected(kernel.output)];
            let args: Vec<&[f32]> = kernel
                .inputs
                .iter()
                .map(|slot| match plan.input_tensors.iter().position(|s| s == slot) {
                    Some(position) => inputs[position],
                    None => values[*slot].as_slice(),
                })
                .collect();

            kernels::run(&kernel.op, &args, &mut result).map_err(|e| match e {
                Error::Execution(msg) => Error::Execution(format!("layer '{}': {}", kernel.name, msg)),
                other => other,
            })?;

            values[kernel.output] = result;
        }

        for (data, slot) in outputs.iter_mut().zip(&plan.output_tensors) {
            data.copy_from_slice(&values[*slot]);
        }

        Ok(())
    }
}
