//! Pinned Memory Pool
//!
//! Bounded staging area for host to device copies. One page-aligned host
//! region is carved up by a [`RingSuballocator`]; blocks return to the ring
//! when dropped, which for in-flight copies happens on the stream thread after
//! the copy has executed.

use std::alloc::{Layout, alloc, dealloc};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use texpage_core::{MemoryBlock, MemoryStats, RingSuballocator};

use crate::device::DevicePtr;
use crate::stream::Stream;
use crate::{DeviceError, DeviceResult};

/// Alignment of the pool and of every block handed out
pub const PINNED_ALIGNMENT: usize = 4096;

struct HostRegion {
    base: NonNull<u8>,
    layout: Layout,
}

impl HostRegion {
    fn new(capacity: usize) -> DeviceResult<Self> {
        let out_of_memory = DeviceError::OutOfPinnedMemory {
            requested: capacity,
            capacity,
        };
        let layout = Layout::from_size_align(capacity.max(1), PINNED_ALIGNMENT)
            .map_err(|_| DeviceError::OutOfPinnedMemory { requested: capacity, capacity })?;
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).ok_or(out_of_memory)?;
        Ok(Self { base, layout })
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

// Safety: the region is only accessed through disjoint PinnedBlocks
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

struct PoolInner {
    region: HostRegion,
    capacity: usize,
    ring: Mutex<RingSuballocator>,
    space_freed: Condvar,
    stats: MemoryStats,
}

impl PoolInner {
    fn release(&self, block: MemoryBlock) {
        let mut ring = self.ring.lock();
        if ring.free(block) {
            self.stats.record_dealloc(block.size as usize);
        } else {
            log::warn!("pinned block at offset {} released twice", block.offset);
        }
        self.space_freed.notify_all();
    }
}

/// Pool of pinned host staging memory. Cloning shares the same pool.
#[derive(Clone)]
pub struct PinnedMemoryPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for PinnedMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedMemoryPool")
            .field("capacity", &self.inner.capacity)
            .field("allocated", &self.allocated())
            .finish()
    }
}

impl PinnedMemoryPool {
    /// Create a pool holding at most `max_bytes` of staging memory
    pub fn new(max_bytes: usize) -> DeviceResult<Self> {
        let region = HostRegion::new(max_bytes)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                region,
                capacity: max_bytes,
                ring: Mutex::new(RingSuballocator::new(max_bytes as u64)),
                space_freed: Condvar::new(),
                stats: MemoryStats::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently handed out
    pub fn allocated(&self) -> usize {
        self.inner.stats.current()
    }

    /// Peak bytes handed out
    pub fn peak_allocated(&self) -> usize {
        self.inner.stats.peak_usage()
    }

    fn check_size(&self, size: usize) -> DeviceResult<()> {
        if size > self.inner.capacity {
            return Err(DeviceError::OutOfPinnedMemory {
                requested: size,
                capacity: self.inner.capacity,
            });
        }
        Ok(())
    }

    fn make_block(&self, block: MemoryBlock, len: usize) -> PinnedBlock {
        self.inner.stats.record_alloc(block.size as usize);
        // Safety: the ring only returns blocks inside [0, capacity)
        let ptr = unsafe { self.inner.region.base.as_ptr().add(block.offset as usize) };
        PinnedBlock {
            pool: self.inner.clone(),
            block,
            ptr: NonNull::new(ptr).unwrap_or(self.inner.region.base),
            len,
        }
    }

    /// Allocate without waiting. Returns None when the ring is full.
    pub fn try_alloc(&self, size: usize) -> DeviceResult<Option<PinnedBlock>> {
        self.check_size(size)?;
        let block = self.inner.ring.lock().alloc(size as u64, PINNED_ALIGNMENT as u64);
        Ok(block.map(|block| self.make_block(block, size)))
    }

    /// Allocate, blocking until enough outstanding blocks have been released
    pub fn alloc(&self, size: usize) -> DeviceResult<PinnedBlock> {
        self.check_size(size)?;
        let mut ring = self.inner.ring.lock();
        loop {
            if let Some(block) = ring.alloc(size as u64, PINNED_ALIGNMENT as u64) {
                drop(ring);
                return Ok(self.make_block(block, size));
            }
            log::trace!("pinned pool full; waiting for {size} bytes");
            self.inner.space_freed.wait(&mut ring);
        }
    }
}

/// Block of pinned staging memory, returned to its pool when dropped
pub struct PinnedBlock {
    pool: Arc<PoolInner>,
    block: MemoryBlock,
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a block has exclusive access to its byte range of the region
unsafe impl Send for PinnedBlock {}
unsafe impl Sync for PinnedBlock {}

impl fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBlock")
            .field("offset", &self.block.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl PinnedBlock {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy the block into device memory on `stream`, then release it there
    pub fn upload_async(self, dst: DevicePtr, stream: &Stream) -> DeviceResult<()> {
        stream.launch("memcpy_htod_pinned", move |device| {
            device.write_bytes(dst, self.as_slice())
        })
    }

    /// Release the block once all work already queued on `stream` has executed
    pub fn free_async(self, stream: &Stream) -> DeviceResult<()> {
        stream.launch_host_func(move || drop(self))
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        self.pool.release(self.block);
    }
}
