//! Ordered asynchronous stream
//!
//! Each stream owns one worker thread. Copies and kernel launches are queued
//! in submission order and return immediately; `synchronize` blocks until the
//! queue has drained and reports the first fault raised since the previous
//! synchronize. Once a stream faults, later operations are skipped until the
//! fault has been reported.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use common::error::{Error, Result};
use crate::device::Device;
use crate::memory::{DeviceBuffer, MappedMemory};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    /// A queued copy or launch
    Run { label: String, task: Task },

    /// Reports the pending fault, if any, once everything before it ran
    Fence(Sender<Option<Error>>),
}

/// Device-to-host copy whose data is valid after the stream is synchronized
#[derive(Debug)]
pub struct PendingTransfer {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl PendingTransfer {
    /// Takes the copied bytes
    ///
    /// Fails if the copy has not completed, i.e. the stream was not
    /// synchronized or the copy was skipped after a fault.
    pub fn take(self) -> Result<Vec<u8>> {
        self.slot.lock().take().ok_or_else(|| {
            Error::Execution("device-to-host copy has not completed".to_string())
        })
    }
}

/// Device memory visible to a kernel for the duration of one launch
pub struct KernelArgs<'a> {
    bindings: Vec<MappedMemory<'a>>,
}

impl<'a> KernelArgs<'a> {
    /// Read view of `src` and write view of `dst` at the same time
    pub fn f32_pair(&mut self, src: usize, dst: usize) -> Result<(&[f32], &mut [f32])> {
        if src == dst {
            return Err(Error::Execution(format!(
                "binding {} cannot be both source and destination",
                src
            )));
        }
        self.binding(src)?;
        self.binding(dst)?;

        if src < dst {
            let (head, tail) = self.bindings.split_at_mut(dst);
            Ok((head[src].f32()?, tail[0].f32_mut()?))
        } else {
            let (head, tail) = self.bindings.split_at_mut(src);
            let dst_view = head[dst].f32_mut()?;
            Ok((tail[0].f32()?, dst_view))
        }
    }

    fn binding(&self, index: usize) -> Result<&MappedMemory<'a>> {
        self.bindings.get(index).ok_or_else(|| {
            Error::Execution(format!(
                "kernel accessed binding {} but only {} are bound",
                index,
                self.bindings.len()
            ))
        })
    }
}

/// An ordered queue of asynchronous device operations
pub struct Stream {
    /// Stream id, for logs
    id: u64,

    /// Device the stream belongs to
    device: Arc<Device>,

    /// Command queue; `None` once shut down
    sender: Option<Sender<Command>>,

    /// Worker thread
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Creates a stream on `device`
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = channel::unbounded();

        let worker = std::thread::Builder::new()
            .name(format!("stream-{}", id))
            .spawn(move || Self::run_worker(id, receiver))
            .map_err(|e| Error::Execution(format!("Failed to create stream: {}", e)))?;

        debug!("Created stream {} on {}", id, device.properties().name);

        Ok(Self {
            id,
            device,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Stream id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Device the stream belongs to
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Queues a host-to-device copy of `src` into `dst`
    ///
    /// The host data is staged when the call is made, so the caller may
    /// reuse `src` immediately.
    pub fn copy_host_to_device(&self, dst: &DeviceBuffer, src: &[u8]) -> Result<()> {
        if src.len() != dst.size() {
            return Err(Error::Execution(format!(
                "host-to-device copy of {} bytes into buffer #{} of {} bytes",
                src.len(),
                dst.id(),
                dst.size()
            )));
        }

        let staged = src.to_vec();
        let dst = dst.clone();
        self.submit(format!("memcpy H2D #{}", dst.id()), move || {
            dst.lock().bytes_mut().copy_from_slice(&staged);
            Ok(())
        })
    }

    /// Queues a device-to-host copy of `src`
    pub fn copy_device_to_host(&self, src: &DeviceBuffer) -> Result<PendingTransfer> {
        let slot = Arc::new(Mutex::new(None));
        let target = slot.clone();
        let src = src.clone();

        self.submit(format!("memcpy D2H #{}", src.id()), move || {
            let bytes = src.lock().bytes().to_vec();
            *target.lock() = Some(bytes);
            Ok(())
        })?;

        Ok(PendingTransfer { slot })
    }

    /// Queues a kernel over `bindings`
    ///
    /// The kernel sees the buffers in the order given. Errors and panics
    /// raised by the kernel fault the stream and surface at `synchronize`.
    pub fn launch<F>(&self, label: &str, bindings: &[&DeviceBuffer], kernel: F) -> Result<()>
    where
        F: FnOnce(&mut KernelArgs<'_>) -> Result<()> + Send + 'static,
    {
        for (i, buffer) in bindings.iter().enumerate() {
            if bindings[..i].iter().any(|other| other.id() == buffer.id()) {
                return Err(Error::Execution(format!(
                    "buffer #{} bound twice to kernel '{}'",
                    buffer.id(),
                    label
                )));
            }
        }

        let buffers: Vec<DeviceBuffer> = bindings.iter().map(|b| (*b).clone()).collect();
        self.submit(format!("launch {}", label), move || {
            let mut args = KernelArgs {
                bindings: buffers.iter().map(|b| b.lock()).collect(),
            };
            let outcome = kernel(&mut args);
            drop(args);
            outcome
        })
    }

    /// Blocks until every queued operation has completed
    pub fn synchronize(&self) -> Result<()> {
        let (reply, done) = channel::bounded(1);
        self.sender()?
            .send(Command::Fence(reply))
            .map_err(|_| Error::Execution(format!("stream {} worker has stopped", self.id)))?;

        match done.recv() {
            Ok(None) => Ok(()),
            Ok(Some(fault)) => Err(fault),
            Err(_) => Err(Error::Execution(format!("stream {} worker has stopped", self.id))),
        }
    }

    fn submit<F>(&self, label: String, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        trace!("stream {}: enqueue {}", self.id, label);
        self.sender()?
            .send(Command::Run { label, task: Box::new(task) })
            .map_err(|_| Error::Execution(format!("stream {} worker has stopped", self.id)))
    }

    fn sender(&self) -> Result<&Sender<Command>> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::Execution(format!("stream {} is shut down", self.id)))
    }

    fn run_worker(id: u64, receiver: Receiver<Command>) {
        let mut fault: Option<Error> = None;

        for command in receiver {
            match command {
                Command::Run { label, task } => {
                    if fault.is_some() {
                        trace!("stream {}: skipping {} after fault", id, label);
                        continue;
                    }

                    let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
                        Err(Error::Execution(format!("{} panicked on the device", label)))
                    });

                    if let Err(e) = outcome {
                        warn!("stream {}: {} failed: {}", id, label, e);
                        fault = Some(match e {
                            Error::Execution(_) => e,
                            other => Error::Execution(format!("{}: {}", label, other)),
                        });
                    }
                }
                Command::Fence(reply) => {
                    let _ = reply.send(fault.take());
                }
            }
        }

        trace!("stream {}: worker exiting", id);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish outstanding work and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("stream {} worker panicked during shutdown", self.id);
            }
        }
        debug!("Destroyed stream {}", self.id);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device", &self.device.properties().name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProperties;

    fn device() -> Arc<Device> {
        Device::new(DeviceProperties {
            name: "test-accel".to_string(),
            compute_major: 7,
            compute_minor: 2,
            total_memory: 1 << 20,
            accelerator_cores: 2,
        })
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn test_copy_launch_copy_in_order() {
        let device = device();
        let stream = Stream::new(device.clone()).unwrap();
        let input = device.allocate(16).unwrap();
        let output = device.allocate(16).unwrap();

        stream.copy_host_to_device(&input, &f32_bytes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
        stream
            .launch("double", &[&input, &output], |args| {
                let (src, dst) = args.f32_pair(0, 1)?;
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = s * 2.0;
                }
                Ok(())
            })
            .unwrap();
        let pending = stream.copy_device_to_host(&output).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(pending.take().unwrap(), f32_bytes(&[2.0, 4.0, 6.0, 8.0]));
    }

    #[test]
    fn test_fault_surfaces_at_synchronize_and_skips_later_work() {
        let device = device();
        let stream = Stream::new(device.clone()).unwrap();
        let buffer = device.allocate(8).unwrap();

        stream
            .launch("broken", &[&buffer], |_| Err(Error::Internal("bad kernel".to_string())))
            .unwrap();
        let pending = stream.copy_device_to_host(&buffer).unwrap();

        let err = stream.synchronize().unwrap_err();
        assert!(err.is_execution());
        assert!(pending.take().is_err());

        // The fault is reported once; the stream is usable again.
        assert!(stream.synchronize().is_ok());
    }

    #[test]
    fn test_kernel_panic_becomes_execution_error() {
        let device = device();
        let stream = Stream::new(device.clone()).unwrap();
        let buffer = device.allocate(8).unwrap();

        stream.launch("panics", &[&buffer], |_| panic!("boom")).unwrap();
        assert!(stream.synchronize().unwrap_err().is_execution());
    }

    #[test]
    fn test_copy_size_mismatch_is_rejected_at_enqueue() {
        let device = device();
        let stream = Stream::new(device.clone()).unwrap();
        let buffer = device.allocate(8).unwrap();

        assert!(stream.copy_host_to_device(&buffer, &[0u8; 4]).unwrap_err().is_execution());
    }

    #[test]
    fn test_in_flight_operations_keep_memory_alive() {
        let device = device();
        let stream = Stream::new(device.clone()).unwrap();
        let buffer = device.allocate(8).unwrap();

        stream.copy_host_to_device(&buffer, &[7u8; 8]).unwrap();
        let pending = stream.copy_device_to_host(&buffer).unwrap();
        drop(buffer);

        stream.synchronize().unwrap();
        assert_eq!(pending.take().unwrap(), vec![7u8; 8]);
        assert_eq!(device.memory_usage().used_bytes, 0);
    }

    #[test]
    fn test_same_buffer_bound_twice_is_rejected() {
        let device = device();
        let stream = Stream::new(device.clone()).unwrap();
        let buffer = device.allocate(8).unwrap();

        let err = stream.launch("alias", &[&buffer, &buffer], |_| Ok(())).unwrap_err();
        assert!(err.is_execution());
    }
}
