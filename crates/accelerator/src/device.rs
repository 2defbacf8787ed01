//! Accelerator device description and ownership of the device heap

use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::error::{Error, Result};
use common::types::AcceleratorCore;
use common::utils::format_bytes;
use pipeline_config::DeviceSettings;
use crate::memory::{DeviceBuffer, DeviceHeap, MemoryUsage};

/// Static properties of an accelerator device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Device name
    pub name: String,

    /// Compute capability major version
    pub compute_major: u32,

    /// Compute capability minor version
    pub compute_minor: u32,

    /// Total device memory in bytes
    pub total_memory: u64,

    /// Number of fixed-function accelerator cores
    pub accelerator_cores: u32,
}

impl DeviceProperties {
    /// Identifies the hardware generation an engine is locked to
    ///
    /// Memory size is not part of the fingerprint.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/cc{}.{}/cores{}",
            self.name, self.compute_major, self.compute_minor, self.accelerator_cores
        )
    }
}

impl From<&DeviceSettings> for DeviceProperties {
    fn from(settings: &DeviceSettings) -> Self {
        Self {
            name: settings.name.clone(),
            compute_major: settings.compute_major,
            compute_minor: settings.compute_minor,
            total_memory: settings.memory_bytes,
            accelerator_cores: settings.accelerator_cores,
        }
    }
}

impl fmt::Display for DeviceProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (compute {}.{}, {}, {} accelerator cores)",
            self.name,
            self.compute_major,
            self.compute_minor,
            format_bytes(self.total_memory),
            self.accelerator_cores
        )
    }
}

/// An accelerator device
///
/// Shared through `Arc` by the runtime, engines, contexts and streams that
/// use it; the heap lives as long as the last allocation does.
#[derive(Debug)]
pub struct Device {
    /// Static properties
    properties: DeviceProperties,

    /// Device memory heap
    heap: Arc<DeviceHeap>,
}

impl Device {
    /// Opens a device with the given properties
    pub fn new(properties: DeviceProperties) -> Arc<Self> {
        info!("Opening accelerator device {}", properties);
        let heap = Arc::new(DeviceHeap::new(properties.total_memory));
        Arc::new(Self { properties, heap })
    }

    /// Opens a device described by configuration
    pub fn from_settings(settings: &DeviceSettings) -> Arc<Self> {
        Self::new(DeviceProperties::from(settings))
    }

    /// Returns the device properties
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Returns the hardware fingerprint engines are locked to
    pub fn fingerprint(&self) -> String {
        self.properties.fingerprint()
    }

    /// Checks that a core selection exists on this device
    pub fn check_core(&self, core: AcceleratorCore) -> std::result::Result<(), String> {
        match core.index() {
            Some(index) if index >= self.properties.accelerator_cores => Err(format!(
                "accelerator core {} requested but device {} has {} cores",
                index, self.properties.name, self.properties.accelerator_cores
            )),
            _ => Ok(()),
        }
    }

    /// Reserves `size` bytes of zeroed device memory
    pub fn allocate(&self, size: usize) -> Result<DeviceBuffer> {
        if size == 0 {
            return Err(Error::Allocation("zero-size device allocation requested".to_string()));
        }

        let buffer = DeviceHeap::allocate(&self.heap, size)?;
        debug!(
            "Allocated device buffer #{} of {} ({} in use)",
            buffer.id(),
            format_bytes(size as u64),
            format_bytes(self.heap.used())
        );

        Ok(buffer)
    }

    /// Returns the current heap usage
    pub fn memory_usage(&self) -> MemoryUsage {
        self.heap.usage()
    }
}
