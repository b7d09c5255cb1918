//! Emulated Device
//!
//! A host-side stand-in for a GPU: device memory is a set of byte buffers
//! addressed by opaque 64-bit device pointers, and work is submitted through
//! [`Stream`]s. Every access is bounds checked against the allocation that
//! contains the address, so a stale or corrupt pointer surfaces as
//! [`DeviceError::InvalidAddress`] instead of touching the wrong buffer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use texpage_core::MemoryStats;

use crate::stream::Stream;
use crate::{DeviceError, DeviceResult};

/// Base address of the first allocation; keeps 0 free as the null pointer.
const HEAP_BASE: u64 = 0x1_0000_0000;
/// Alignment of every device allocation
const ALLOCATION_ALIGNMENT: u64 = 256;

/// Address in device memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one
    pub fn offset(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }

    pub fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device capabilities reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Device name
    pub name: String,
    /// Device ordinal
    pub ordinal: u32,
    /// Whether sparse texture arrays are supported
    pub sparse_arrays: bool,
    /// Whether the device runs under a TCC (compute-only) driver
    pub tcc_driver: bool,
    /// Total device memory in bytes
    pub total_memory: u64,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            name: String::from("Emulated Device"),
            ordinal: 0,
            sparse_arrays: true,
            tcc_driver: false,
            total_memory: 4 * 1024 * 1024 * 1024,
        }
    }
}

struct Allocation {
    base: u64,
    size: u64,
    bytes: Mutex<Vec<u8>>,
}

struct Heap {
    next_address: u64,
    allocations: BTreeMap<u64, Arc<Allocation>>,
}

struct DeviceInner {
    capabilities: DeviceCapabilities,
    heap: Mutex<Heap>,
    stats: MemoryStats,
    next_stream_id: AtomicU64,
}

/// Handle to an emulated device. Cloning shares the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.capabilities.name)
            .field("ordinal", &self.inner.capabilities.ordinal)
            .field("memory_used", &self.memory_used())
            .finish()
    }
}

impl Device {
    /// Create a device with the given capabilities
    pub fn new(capabilities: DeviceCapabilities) -> Self {
        log::info!(
            "Created device {} '{}' (sparse arrays: {}, TCC driver: {})",
            capabilities.ordinal,
            capabilities.name,
            capabilities.sparse_arrays,
            capabilities.tcc_driver
        );
        Self {
            inner: Arc::new(DeviceInner {
                capabilities,
                heap: Mutex::new(Heap {
                    next_address: HEAP_BASE,
                    allocations: BTreeMap::new(),
                }),
                stats: MemoryStats::new(),
                next_stream_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.inner.capabilities
    }

    pub fn ordinal(&self) -> u32 {
        self.inner.capabilities.ordinal
    }

    /// Allocate `size` bytes of zeroed device memory
    pub fn alloc(&self, size: usize) -> DeviceResult<DevicePtr> {
        let mut heap = self.inner.heap.lock();
        let total = self.inner.capabilities.total_memory;
        let used = self.memory_used();
        if used + size as u64 > total {
            return Err(DeviceError::OutOfMemory {
                requested: size as u64,
                available: total.saturating_sub(used),
            });
        }

        let base = heap.next_address;
        let span = (size.max(1) as u64).div_ceil(ALLOCATION_ALIGNMENT) * ALLOCATION_ALIGNMENT;
        heap.next_address += span;
        heap.allocations.insert(
            base,
            Arc::new(Allocation {
                base,
                size: size as u64,
                bytes: Mutex::new(vec![0; size]),
            }),
        );
        self.inner.stats.record_alloc(size);
        Ok(DevicePtr(base))
    }

    /// Release an allocation made with [`Device::alloc`]
    pub fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let allocation = self
            .inner
            .heap
            .lock()
            .allocations
            .remove(&ptr.0)
            .ok_or(DeviceError::InvalidAddress { address: ptr.0, len: 0 })?;
        self.inner.stats.record_dealloc(allocation.size as usize);
        Ok(())
    }

    /// Bytes of device memory currently allocated
    pub fn memory_used(&self) -> u64 {
        self.inner.stats.current() as u64
    }

    /// Peak bytes of device memory allocated
    pub fn peak_memory_used(&self) -> u64 {
        self.inner.stats.peak_usage() as u64
    }

    /// Create a new stream on this device
    pub fn create_stream(&self) -> DeviceResult<Stream> {
        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        Stream::new(self.clone(), id)
    }

    fn find(&self, ptr: DevicePtr, len: usize) -> DeviceResult<Arc<Allocation>> {
        let invalid = DeviceError::InvalidAddress { address: ptr.0, len };
        let heap = self.inner.heap.lock();
        let (_, allocation) = heap.allocations.range(..=ptr.0).next_back().ok_or(invalid)?;
        let allocation = allocation.clone();
        drop(heap);

        let end = ptr.0 + len as u64;
        if end > allocation.base + allocation.size {
            return Err(DeviceError::InvalidAddress { address: ptr.0, len });
        }
        Ok(allocation)
    }

    /// Run `f` on the bytes `[ptr, ptr + len)` with exclusive access to them
    pub fn with_bytes_mut<R>(
        &self,
        ptr: DevicePtr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> DeviceResult<R> {
        let allocation = self.find(ptr, len)?;
        let start = (ptr.0 - allocation.base) as usize;
        let mut bytes = allocation.bytes.lock();
        Ok(f(&mut bytes[start..start + len]))
    }

    /// Copy host bytes into device memory
    pub fn write_bytes(&self, dst: DevicePtr, src: &[u8]) -> DeviceResult<()> {
        self.with_bytes_mut(dst, src.len(), |bytes| bytes.copy_from_slice(src))
    }

    /// Copy device memory into a host buffer
    pub fn read_bytes(&self, src: DevicePtr, dst: &mut [u8]) -> DeviceResult<()> {
        self.with_bytes_mut(src, dst.len(), |bytes| dst.copy_from_slice(bytes))
    }

    /// Set `len` bytes starting at `dst` to `value`
    pub fn fill(&self, dst: DevicePtr, len: usize, value: u8) -> DeviceResult<()> {
        self.with_bytes_mut(dst, len, |bytes| bytes.fill(value))
    }

    pub fn read_value<T: Pod>(&self, src: DevicePtr) -> DeviceResult<T> {
        let mut value = T::zeroed();
        self.read_bytes(src, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn write_value<T: Pod>(&self, dst: DevicePtr, value: &T) -> DeviceResult<()> {
        self.write_bytes(dst, bytemuck::bytes_of(value))
    }

    /// Read `count` consecutive values starting at `src`
    pub fn read_vec<T: Pod>(&self, src: DevicePtr, count: usize) -> DeviceResult<Vec<T>> {
        let mut values = vec![T::zeroed(); count];
        self.read_bytes(src, bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }

    pub fn write_slice<T: Pod>(&self, dst: DevicePtr, values: &[T]) -> DeviceResult<()> {
        self.write_bytes(dst, bytemuck::cast_slice(values))
    }

    /// Atomically OR `mask` into the 32-bit word at `ptr`, returning the old value
    pub fn fetch_or_u32(&self, ptr: DevicePtr, mask: u32) -> DeviceResult<u32> {
        self.with_bytes_mut(ptr, 4, |bytes| {
            let mut word = [0u8; 4];
            word.copy_from_slice(bytes);
            let old = u32::from_ne_bytes(word);
            bytes.copy_from_slice(&(old | mask).to_ne_bytes());
            old
        })
    }
}
