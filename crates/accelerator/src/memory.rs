//! Device memory heap and buffer wrapper
//!
//! A `DeviceBuffer` is an `Arc` over its allocation. Stream operations hold
//! their own clone while in flight, so the memory is released exactly once,
//! when the last holder drops, and never while an operation still uses it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use common::error::{Error, Result};
use common::utils::format_bytes;

/// Snapshot of heap usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Bytes currently reserved
    pub used_bytes: u64,

    /// Heap capacity in bytes
    pub capacity_bytes: u64,

    /// Number of live allocations
    pub live_allocations: usize,
}

impl MemoryUsage {
    /// Bytes still available
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// Bounded device memory heap
#[derive(Debug)]
pub(crate) struct DeviceHeap {
    /// Capacity in bytes
    capacity: u64,

    /// Bytes currently reserved
    used: AtomicU64,

    /// Live allocations (id -> size)
    live: DashMap<u64, usize>,

    /// Next allocation id
    next_id: AtomicU64,
}

impl DeviceHeap {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            used_bytes: self.used(),
            capacity_bytes: self.capacity,
            live_allocations: self.live.len(),
        }
    }

    /// Reserves `size` bytes or fails without side effects
    pub(crate) fn allocate(heap: &Arc<DeviceHeap>, size: usize) -> Result<DeviceBuffer> {
        let request = size as u64;
        heap.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(request).filter(|total| *total <= heap.capacity)
            })
            .map_err(|used| {
                Error::Allocation(format!(
                    "out of device memory: requested {}, {} of {} in use",
                    format_bytes(request),
                    format_bytes(used),
                    format_bytes(heap.capacity)
                ))
            })?;

        let id = heap.next_id.fetch_add(1, Ordering::SeqCst);
        heap.live.insert(id, size);

        // Backed by u64 words so f32 views are always aligned.
        let words = vec![0u64; (size + 7) / 8];

        Ok(DeviceBuffer {
            inner: Arc::new(Allocation {
                id,
                size,
                words: Mutex::new(words),
                heap: heap.clone(),
            }),
        })
    }

    fn release(&self, id: u64, size: usize) {
        if self.live.remove(&id).is_some() {
            self.used.fetch_sub(size as u64, Ordering::SeqCst);
            trace!("Released device buffer #{} ({})", id, format_bytes(size as u64));
        }
    }
}

/// One device allocation; returned to the heap on drop
#[derive(Debug)]
pub(crate) struct Allocation {
    id: u64,
    size: usize,
    words: Mutex<Vec<u64>>,
    heap: Arc<DeviceHeap>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.heap.release(self.id, self.size);
    }
}

/// Handle to device memory
///
/// Cloning shares the allocation; it is not a copy.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    inner: Arc<Allocation>,
}

impl DeviceBuffer {
    /// Allocation id, unique per device
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Synchronously reads the buffer contents
    ///
    /// Only meaningful once every stream that writes this buffer is drained.
    pub fn to_host(&self) -> Vec<u8> {
        let words = self.inner.words.lock();
        bytemuck::cast_slice::<u64, u8>(&words)[..self.inner.size].to_vec()
    }

    pub(crate) fn lock(&self) -> MappedMemory<'_> {
        MappedMemory {
            guard: self.inner.words.lock(),
            size: self.inner.size,
        }
    }
}

/// Exclusive view of a buffer's memory while an operation runs
pub(crate) struct MappedMemory<'a> {
    guard: MutexGuard<'a, Vec<u64>>,
    size: usize,
}

impl<'a> MappedMemory<'a> {
    pub(crate) fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.guard)[..self.size]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.guard)[..self.size]
    }

    pub(crate) fn f32(&self) -> Result<&[f32]> {
        self.check_f32()?;
        Ok(&bytemuck::cast_slice::<u64, f32>(&self.guard)[..self.size / 4])
    }

    pub(crate) fn f32_mut(&mut self) -> Result<&mut [f32]> {
        self.check_f32()?;
        let len = self.size / 4;
        Ok(&mut bytemuck::cast_slice_mut::<u64, f32>(&mut self.guard)[..len])
    }

    fn check_f32(&self) -> Result<()> {
        if self.size % 4 != 0 {
            return Err(Error::Execution(format!(
                "buffer of {} bytes cannot be viewed as f32",
                self.size
            )));
        }
        Ok(())
    }
}
