//! Memory Management
//!
//! Host-side bookkeeping allocators used by the paging engine:
//! - Item pool for recycled fixed-size records (device contexts, sampler slots)
//! - Ring suballocator for staging buffers that are released out of order
//! - Memory usage statistics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory usage statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Total bytes allocated
    pub allocated: AtomicUsize,
    /// Peak bytes allocated
    pub peak: AtomicUsize,
    /// Number of allocations
    pub allocation_count: AtomicUsize,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: usize) {
        let new_size = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(new_size, Ordering::Relaxed);
    }

    /// Record a deallocation
    pub fn record_dealloc(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }

    /// Get current allocated bytes
    pub fn current(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get peak allocated bytes
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get total allocation count
    pub fn count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }
}

/// Pool of reusable items addressed by index.
///
/// Freed slots go onto a LIFO free list, so the most recently freed item is
/// handed out again first. Items are never dropped while the pool lives; the
/// owner decides what "freeing" means for the payload (for example returning a
/// device buffer to a reusable state).
#[derive(Debug)]
pub struct ItemPool<T> {
    slots: Vec<T>,
    free_list: Vec<usize>,
}

impl<T> ItemPool<T> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Take an item from the free list, or build a new one with `create`.
    ///
    /// `create` receives the index the new item will occupy.
    pub fn allocate_with<E>(&mut self, create: impl FnOnce(usize) -> Result<T, E>) -> Result<usize, E> {
        if let Some(index) = self.free_list.pop() {
            return Ok(index);
        }
        let index = self.slots.len();
        self.slots.push(create(index)?);
        Ok(index)
    }

    /// Return an item to the pool
    pub fn free(&mut self, index: usize) {
        debug_assert!(index < self.slots.len(), "item {index} was not allocated from this pool");
        debug_assert!(!self.free_list.contains(&index), "item {index} freed twice");
        self.free_list.push(index);
    }

    /// Number of items currently handed out
    pub fn size(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Number of items ever created
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)
    }

    /// Iterate over every item, allocated or not
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

impl<T: Default> ItemPool<T> {
    /// Allocate a default-constructed item
    pub fn allocate(&mut self) -> usize {
        match self.allocate_with(|_| Ok::<T, std::convert::Infallible>(T::default())) {
            Ok(index) => index,
            Err(never) => match never {},
        }
    }
}

impl<T> Default for ItemPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A block handed out by a suballocator, as an offset into its backing region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
struct RingEntry {
    block: MemoryBlock,
    freed: bool,
}

/// Ring-buffer suballocator over a fixed-size region.
///
/// Allocation advances a head cursor and wraps to the start of the region when
/// the end is reached. Blocks may be freed in any order, but space is only
/// reclaimed once the oldest outstanding block is freed: the tail then moves
/// past every freed block at the front of the ring.
#[derive(Debug)]
pub struct RingSuballocator {
    capacity: u64,
    head: u64,
    outstanding: VecDeque<RingEntry>,
    allocated: u64,
}

impl RingSuballocator {
    /// Create a suballocator over `capacity` bytes
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            head: 0,
            outstanding: VecDeque::new(),
            allocated: 0,
        }
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns None when the ring has no contiguous room left.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<MemoryBlock> {
        let size = size.max(1);
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());

        let offset = match self.outstanding.front() {
            None => {
                self.head = 0;
                (size <= self.capacity).then_some(0)?
            }
            Some(oldest) => {
                let tail = oldest.block.offset;
                let start = align_up(self.head, align);
                if self.head > tail {
                    // Live region is [tail, head); try the end, then wrap to the front.
                    if start + size <= self.capacity {
                        start
                    } else if size <= tail {
                        log::trace!("ring suballocator wrapped at offset {}", self.head);
                        0
                    } else {
                        return None;
                    }
                } else if start + size <= tail {
                    // Wrapped: free space is [head, tail).
                    start
                } else {
                    return None;
                }
            }
        };

        let block = MemoryBlock { offset, size };
        self.head = offset + size;
        self.allocated += size;
        self.outstanding.push_back(RingEntry { block, freed: false });
        Some(block)
    }

    /// Release a block. Returns false if the block is unknown or already freed.
    pub fn free(&mut self, block: MemoryBlock) -> bool {
        let Some(entry) = self
            .outstanding
            .iter_mut()
            .find(|entry| entry.block == block && !entry.freed)
        else {
            return false;
        };
        entry.freed = true;
        self.allocated -= block.size;

        while self.outstanding.front().is_some_and(|entry| entry.freed) {
            self.outstanding.pop_front();
        }
        true
    }

    /// Bytes currently allocated and not yet freed
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// True when no block is outstanding
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
