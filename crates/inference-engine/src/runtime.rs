//! Runtime: turns engine blobs back into executable engines
//!
//! A `Runtime` is bound to one device and may deserialize any number of
//! blobs. Deserialization checks, in order: framing and checksum, the
//! device fingerprint, the payload itself, the accelerator core selection,
//! and finally the binding contract of exactly one input and one output.

use std::sync::Arc;
use tracing::{debug, info, warn};

use accelerator::Device;
use common::error::{Error, Result};
use common::types::{AcceleratorCore, BindingInfo, BindingRole};
use model_compiler::{CompiledEngine, LayerInfo};
use crate::blob::EngineBlob;
use crate::context::ExecutionContext;

/// Long-lived deserializer for one device
#[derive(Debug, Clone)]
pub struct Runtime {
    device: Arc<Device>,
}

impl Runtime {
    /// Creates a runtime on `device`
    pub fn new(device: Arc<Device>) -> Self {
        debug!("Created runtime on {}", device.properties().name);
        Self { device }
    }

    /// Deserializes `blob` into an engine running on `core`
    pub fn deserialize(&self, blob: &EngineBlob, core: AcceleratorCore) -> Result<Engine> {
        let (header, payload) = blob.decode()?;

        let fingerprint = self.device.fingerprint();
        if header.device_fingerprint != fingerprint {
            return Err(Error::Deserialize(format!(
                "engine was built for '{}' but this device is '{}'",
                header.device_fingerprint, fingerprint
            )));
        }

        let compiled: CompiledEngine = serde_json::from_slice(&payload)
            .map_err(|e| Error::Deserialize(format!("malformed engine payload: {}", e)))?;
        compiled
            .validate()
            .map_err(|e| Error::Deserialize(format!("inconsistent engine: {}", e)))?;

        if compiled.device_fingerprint() != header.device_fingerprint {
            return Err(Error::Deserialize(
                "engine payload and blob header disagree on the device".to_string(),
            ));
        }

        self.device.check_core(core).map_err(Error::Deserialize)?;
        if compiled.uses_core() && !core.is_selected() {
            return Err(Error::Deserialize(
                "engine places layers on an accelerator core but no core is selected".to_string(),
            ));
        }
        if core.is_selected() && !compiled.uses_core() {
            warn!(
                "Engine {} runs entirely on the general processor; ignoring {}",
                compiled.id(),
                core
            );
        }

        check_binding_contract(compiled.bindings())?;

        info!(
            "Deserialized engine {} ({} bindings, {} layers, checksum {})",
            compiled.id(),
            compiled.num_bindings(),
            compiled.num_layers(),
            &header.checksum_hex()[..12]
        );

        Ok(Engine {
            compiled: Arc::new(compiled),
            device: self.device.clone(),
            core,
        })
    }
}

/// Exactly two bindings: one input and one output
fn check_binding_contract(bindings: &[BindingInfo]) -> Result<()> {
    if bindings.len() != 2 {
        return Err(Error::BindingMismatch(format!(
            "engine has {} bindings, expected 2",
            bindings.len()
        )));
    }

    let inputs = bindings.iter().filter(|b| b.role == BindingRole::Input).count();
    let outputs = bindings.iter().filter(|b| b.role == BindingRole::Output).count();
    if inputs != 1 || outputs != 1 {
        return Err(Error::BindingMismatch(format!(
            "engine has {} input and {} output bindings, expected one of each",
            inputs, outputs
        )));
    }

    Ok(())
}

/// Deserialized engine ready to create execution contexts
#[derive(Debug, Clone)]
pub struct Engine {
    /// Plan and metadata
    compiled: Arc<CompiledEngine>,

    /// Device the engine runs on
    device: Arc<Device>,

    /// Selected accelerator core
    core: AcceleratorCore,
}

impl Engine {
    /// Creates a context with its own stream
    pub fn create_execution_context(&self) -> Result<ExecutionContext> {
        ExecutionContext::new(self.compiled.clone(), self.device.clone())
    }

    /// Compiled plan and metadata
    pub fn compiled(&self) -> &CompiledEngine {
        &self.compiled
    }

    /// Number of bindings
    pub fn num_bindings(&self) -> usize {
        self.compiled.num_bindings()
    }

    /// Binding descriptors
    pub fn bindings(&self) -> &[BindingInfo] {
        self.compiled.bindings()
    }

    /// Number of layers
    pub fn num_layers(&self) -> usize {
        self.compiled.num_layers()
    }

    /// Layer descriptors
    pub fn layers(&self) -> &[LayerInfo] {
        self.compiled.layers()
    }

    /// Largest accepted batch
    pub fn max_batch_size(&self) -> usize {
        self.compiled.max_batch_size()
    }

    /// Selected accelerator core
    pub fn core(&self) -> AcceleratorCore {
        self.core
    }
}
