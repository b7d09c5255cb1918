//! Device Memory Manager
//!
//! Owns every device allocation of the paging engine:
//! - tile arenas: fixed-size blocks split into 64 KiB tile slots, created on
//!   demand up to a budget and deleted as a unit when the budget shrinks
//! - the page table, residence bits and LRU table shared by all contexts
//! - a pool of per-launch device context buffers
//! - texture sampler slots and dense texture storage
//!
//! Tile blocks are addressed by packed [`TileBlockDesc`]s, never by pointer,
//! so a page table entry can always be checked against the arena table.

use std::fmt;
use std::mem::size_of;

use ahash::AHashMap;
use parking_lot::Mutex;
use texpage_core::ItemPool;
use texpage_platform::{Device, DevicePtr};

use crate::device_context::{
    DeviceContext, DevicePageMapping, DeviceView, StalePage, array_length, bitmap_words,
};
use crate::options::Options;
use crate::sampler::TextureSampler;
use crate::{PagingError, PagingResult};

/// Size of one tile slot
pub const TILE_SIZE_IN_BYTES: u64 = 64 * 1024;

/// Packed tile block reference: arena id in bits 0..32, first tile in 32..48,
/// tile count in 48..64. A descriptor with zero tiles is invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TileBlockDesc(pub u64);

impl TileBlockDesc {
    pub fn new(arena_id: u32, tile_id: u16, num_tiles: u16) -> Self {
        Self(arena_id as u64 | (tile_id as u64) << 32 | (num_tiles as u64) << 48)
    }

    pub fn arena_id(self) -> u32 {
        self.0 as u32
    }

    pub fn tile_id(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn num_tiles(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn is_valid(self) -> bool {
        self.num_tiles() > 0
    }
}

/// A tile block together with the generation of the arena it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileBlockHandle {
    pub desc: TileBlockDesc,
    pub epoch: u32,
}

struct TileArena {
    ptr: DevicePtr,
    /// Bit set = slot free
    free_slots: u64,
    /// Blocks handed out whose fill has not finished
    pending_fills: u32,
    /// Over budget: no new blocks, deleted once drained
    retired: bool,
    epoch: u32,
}

impl TileArena {
    /// First run of `num_tiles` free slots
    fn find_free_run(&self, num_tiles: u32, tiles_per_arena: u32) -> Option<u32> {
        let mask = run_mask(num_tiles);
        (0..=tiles_per_arena - num_tiles).find(|&start| (self.free_slots >> start) & mask == mask)
    }
}

fn run_mask(num_tiles: u32) -> u64 {
    if num_tiles >= 64 {
        u64::MAX
    } else {
        (1u64 << num_tiles) - 1
    }
}

struct SharedBuffers {
    page_table: DeviceView,
    residence_bits: DeviceView,
    lru_table: DeviceView,
}

struct MemoryState {
    arenas: Vec<TileArena>,
    /// `None` is unlimited
    max_arenas: Option<u32>,
    next_epoch: u32,
    contexts: ItemPool<DeviceContext>,
    samplers: ItemPool<DevicePtr>,
    sampler_slots: AHashMap<u64, usize>,
    dense_allocations: AHashMap<u64, u64>,
    bytes_allocated: u64,
}

/// Device memory for tiles, contexts and samplers. Internally synchronized.
pub struct DeviceMemoryManager {
    device: Device,
    options: Options,
    shared: SharedBuffers,
    state: Mutex<MemoryState>,
}

impl fmt::Debug for DeviceMemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeviceMemoryManager")
            .field("arenas", &state.arenas.len())
            .field("max_arenas", &state.max_arenas)
            .field("contexts", &state.contexts.capacity())
            .field("bytes_allocated", &state.bytes_allocated)
            .finish()
    }
}

impl DeviceMemoryManager {
    /// Allocate the shared paging buffers on `device`
    pub fn new(device: Device, options: &Options) -> PagingResult<Self> {
        let num_pages = options.num_pages;
        let page_table_bytes = options.num_page_table_entries as usize * size_of::<u64>();
        let residence_bytes = bitmap_words(num_pages) as usize * size_of::<u32>();
        let lru_bytes = num_pages as usize;

        let shared = SharedBuffers {
            page_table: DeviceView::new(device.alloc(page_table_bytes)?, options.num_page_table_entries),
            residence_bits: DeviceView::new(device.alloc(residence_bytes)?, bitmap_words(num_pages)),
            lru_table: DeviceView::new(device.alloc(lru_bytes)?, num_pages),
        };

        let manager = Self {
            device,
            options: options.clone(),
            shared,
            state: Mutex::new(MemoryState {
                arenas: Vec::new(),
                max_arenas: None,
                next_epoch: 1,
                contexts: ItemPool::new(),
                samplers: ItemPool::new(),
                sampler_slots: AHashMap::new(),
                dense_allocations: AHashMap::new(),
                bytes_allocated: (page_table_bytes + residence_bytes + lru_bytes) as u64,
            }),
        };
        manager.set_max_texture_tile_memory(options.max_tex_mem_per_device);
        Ok(manager)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn arena_size(&self) -> u64 {
        self.options.arena_size
    }

    pub fn tiles_per_arena(&self) -> u32 {
        self.options.tiles_per_arena()
    }

    // ---- Tile arenas ----

    /// Allocate `num_tiles` contiguous tile slots, creating an arena if the
    /// budget allows. Returns `None` when the budget is exhausted.
    pub fn alloc_tile_block(&self, num_tiles: u32) -> PagingResult<Option<TileBlockHandle>> {
        let tiles_per_arena = self.tiles_per_arena();
        if num_tiles == 0 || num_tiles > tiles_per_arena {
            return Err(PagingError::TilePoolExhausted {
                num_tiles,
                arena_tiles: tiles_per_arena,
            });
        }

        let mut state = self.state.lock();
        let found = state.arenas.iter().enumerate().find_map(|(id, arena)| {
            if arena.retired {
                return None;
            }
            arena
                .find_free_run(num_tiles, tiles_per_arena)
                .map(|start| (id, start))
        });

        let (arena_id, start) = match found {
            Some(found) => found,
            None => {
                let within_budget = state
                    .max_arenas
                    .is_none_or(|max| (state.arenas.len() as u32) < max);
                if !within_budget {
                    return Ok(None);
                }
                let ptr = self.device.alloc(self.options.arena_size as usize)?;
                let epoch = state.next_epoch;
                state.next_epoch += 1;
                state.bytes_allocated += self.options.arena_size;
                state.arenas.push(TileArena {
                    ptr,
                    free_slots: run_mask(tiles_per_arena),
                    pending_fills: 0,
                    retired: false,
                    epoch,
                });
                log::debug!("created tile arena {} at {}", state.arenas.len() - 1, ptr);
                (state.arenas.len() - 1, 0)
            }
        };

        let arena = &mut state.arenas[arena_id];
        arena.free_slots &= !(run_mask(num_tiles) << start);
        arena.pending_fills += 1;
        Ok(Some(TileBlockHandle {
            desc: TileBlockDesc::new(arena_id as u32, start as u16, num_tiles as u16),
            epoch: arena.epoch,
        }))
    }

    /// Return a tile block. Blocks of deleted or recreated arenas are ignored.
    pub fn free_tile_block(&self, handle: TileBlockHandle) {
        let mut state = self.state.lock();
        let desc = handle.desc;
        match state.arenas.get_mut(desc.arena_id() as usize) {
            Some(arena) if arena.epoch == handle.epoch => {
                let bits = run_mask(desc.num_tiles() as u32) << desc.tile_id();
                debug_assert_eq!(arena.free_slots & bits, 0, "tile block {desc:?} freed twice");
                arena.free_slots |= bits;
            }
            _ => log::trace!("ignoring free of stale tile block {:?}", desc),
        }
    }

    /// Mark the fill into a block as finished, whether it succeeded or not
    pub fn finish_fill(&self, handle: TileBlockHandle) {
        let mut state = self.state.lock();
        match state.arenas.get_mut(handle.desc.arena_id() as usize) {
            Some(arena) if arena.epoch == handle.epoch => {
                arena.pending_fills = arena.pending_fills.saturating_sub(1);
            }
            _ => {}
        }
    }

    /// Whether a block still belongs to an arena that is in budget
    pub fn is_live(&self, handle: TileBlockHandle) -> bool {
        let state = self.state.lock();
        state
            .arenas
            .get(handle.desc.arena_id() as usize)
            .is_some_and(|arena| arena.epoch == handle.epoch && !arena.retired)
    }

    /// Device address of the first tile of a block
    pub fn tile_block_ptr(&self, desc: TileBlockDesc) -> Option<DevicePtr> {
        let state = self.state.lock();
        state
            .arenas
            .get(desc.arena_id() as usize)
            .map(|arena| arena.ptr.offset(desc.tile_id() as u64 * TILE_SIZE_IN_BYTES))
    }

    /// At the arena budget with no free slot left
    pub fn need_tile_blocks_freed(&self) -> bool {
        let state = self.state.lock();
        let Some(max) = state.max_arenas else {
            return false;
        };
        let live = state.arenas.iter().filter(|arena| !arena.retired);
        let has_free_slot = live.clone().any(|arena| arena.free_slots != 0);
        live.count() as u32 >= max && !has_free_slot
    }

    /// Recompute the arena budget. Returns the new maximum arena count, 0 for unlimited.
    ///
    /// Arenas beyond the budget are retired; the caller must invalidate the
    /// pages mapped into them before [`Self::release_retired_arenas`] deletes them.
    pub fn set_max_texture_tile_memory(&self, max_bytes: u64) -> u32 {
        let max_arenas = if max_bytes == 0 {
            None
        } else {
            Some((max_bytes / self.options.arena_size).max(1) as u32)
        };

        let mut state = self.state.lock();
        state.max_arenas = max_arenas;
        let mut retired = 0;
        for (id, arena) in state.arenas.iter_mut().enumerate() {
            arena.retired = max_arenas.is_some_and(|max| id as u32 >= max);
            retired += arena.retired as usize;
        }
        log::info!(
            "tile memory budget set to {} bytes ({} arenas, {} retired)",
            max_bytes,
            max_arenas.map_or_else(|| "unlimited".to_string(), |max| max.to_string()),
            retired
        );
        max_arenas.unwrap_or(0)
    }

    /// Delete retired arenas from the end of the table once no fill into them is pending
    pub fn release_retired_arenas(&self) -> PagingResult<usize> {
        let mut state = self.state.lock();
        let mut released = 0;
        while let Some(arena) = state.arenas.last() {
            if !arena.retired || arena.pending_fills > 0 {
                break;
            }
            let ptr = arena.ptr;
            state.arenas.pop();
            state.bytes_allocated -= self.options.arena_size;
            self.device.free(ptr)?;
            released += 1;
        }
        if released > 0 {
            log::debug!("released {} tile arenas, {} remain", released, state.arenas.len());
        }
        Ok(released)
    }

    pub fn num_arenas(&self) -> usize {
        self.state.lock().arenas.len()
    }

    /// Maximum arena count, `None` when unlimited
    pub fn max_arenas(&self) -> Option<u32> {
        self.state.lock().max_arenas
    }

    // ---- Device contexts ----

    /// Take a context from the pool. Never blocks: the pool grows past
    /// `max_active_streams` with a warning.
    pub fn allocate_device_context(&self) -> PagingResult<DeviceContext> {
        let mut state = self.state.lock();
        let in_use = state.contexts.size();
        if in_use >= self.options.max_active_streams as usize {
            log::warn!(
                "{} device contexts in use exceeds max_active_streams ({}); growing the pool",
                in_use + 1,
                self.options.max_active_streams
            );
        }

        let mut created = 0u64;
        let index = state.contexts.allocate_with(|index| {
            let (context, bytes) = self.create_device_context(index as u32)?;
            created = bytes;
            Ok::<_, PagingError>(context)
        })?;
        state.bytes_allocated += created;

        let context = *state
            .contexts
            .get(index)
            .ok_or(PagingError::UnknownPage(index as u32))?;
        Ok(context)
    }

    /// Return a context to the pool
    pub fn free_device_context(&self, pool_index: u32) {
        let mut state = self.state.lock();
        if (pool_index as usize) < state.contexts.capacity() {
            state.contexts.free(pool_index as usize);
        } else {
            log::warn!("ignoring free of unknown device context {}", pool_index);
        }
    }

    pub fn num_device_contexts_in_use(&self) -> usize {
        self.state.lock().contexts.size()
    }

    fn create_device_context(&self, pool_index: u32) -> PagingResult<(DeviceContext, u64)> {
        let options = &self.options;
        let mut bytes = 0u64;
        let mut view = |count: u32, elem_size: usize| -> PagingResult<DeviceView> {
            let len = count as usize * elem_size;
            bytes += len as u64;
            Ok(DeviceView::new(self.device.alloc(len)?, count))
        };

        let context = DeviceContext {
            page_table: self.shared.page_table,
            residence_bits: self.shared.residence_bits,
            lru_table: self.shared.lru_table,
            request_bits: view(bitmap_words(options.num_pages), size_of::<u32>())?,
            requested_pages: view(options.max_requested_pages, size_of::<u32>())?,
            stale_pages: view(options.max_stale_pages, size_of::<StalePage>())?,
            filled_pages: view(options.max_filled_pages, size_of::<DevicePageMapping>())?,
            invalidated_pages: view(options.max_invalidated_pages, size_of::<u32>())?,
            array_lengths: view(array_length::COUNT as u32, size_of::<u32>())?,
            flags: 0,
            pool_index,
        };
        log::debug!("created device context {}", pool_index);
        Ok((context, bytes))
    }

    // ---- Samplers and dense storage ----

    /// Device slot for a [`TextureSampler`]
    pub fn allocate_sampler(&self) -> PagingResult<DevicePtr> {
        let mut state = self.state.lock();
        let index = state
            .samplers
            .allocate_with(|_| self.device.alloc(size_of::<TextureSampler>()))?;
        let ptr = *state
            .samplers
            .get(index)
            .ok_or(PagingError::UnknownPage(index as u32))?;
        if state.sampler_slots.insert(ptr.0, index).is_none() {
            state.bytes_allocated += size_of::<TextureSampler>() as u64;
        }
        Ok(ptr)
    }

    /// Return a sampler slot to the pool
    pub fn free_sampler(&self, ptr: DevicePtr) {
        let mut state = self.state.lock();
        match state.sampler_slots.get(&ptr.0).copied() {
            Some(index) => state.samplers.free(index),
            None => log::warn!("ignoring free of unknown sampler slot {}", ptr),
        }
    }

    /// Storage for a texture loaded in full
    pub fn allocate_dense(&self, size: u64) -> PagingResult<DevicePtr> {
        let ptr = self.device.alloc(size as usize)?;
        let mut state = self.state.lock();
        state.dense_allocations.insert(ptr.0, size);
        state.bytes_allocated += size;
        Ok(ptr)
    }

    pub fn free_dense(&self, ptr: DevicePtr) -> PagingResult<()> {
        let mut state = self.state.lock();
        if let Some(size) = state.dense_allocations.remove(&ptr.0) {
            state.bytes_allocated -= size;
            self.device.free(ptr)?;
        }
        Ok(())
    }

    /// Bytes of device memory held by the manager
    pub fn memory_used(&self) -> u64 {
        self.state.lock().bytes_allocated
    }

    /// Bytes of tile arenas
    pub fn tile_memory_used(&self) -> u64 {
        self.state.lock().arenas.len() as u64 * self.options.arena_size
    }
}

impl Drop for DeviceMemoryManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut ptrs: Vec<DevicePtr> = state.arenas.iter().map(|arena| arena.ptr).collect();
        for context in state.contexts.iter() {
            ptrs.extend([
                context.request_bits,
                context.requested_pages,
                context.stale_pages,
                context.filled_pages,
                context.invalidated_pages,
                context.array_lengths,
            ]
            .map(|view| view.device_ptr()));
        }
        ptrs.extend(state.samplers.iter().copied());
        ptrs.extend(state.dense_allocations.keys().map(|&addr| DevicePtr(addr)));
        ptrs.extend([
            self.shared.page_table.device_ptr(),
            self.shared.residence_bits.device_ptr(),
            self.shared.lru_table.device_ptr(),
        ]);

        for ptr in ptrs {
            if let Err(err) = self.device.free(ptr) {
                log::warn!("failed to free device allocation {}: {}", ptr, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texpage_platform::DeviceCapabilities;

    fn manager(options: Options) -> DeviceMemoryManager {
        DeviceMemoryManager::new(Device::new(DeviceCapabilities::default()), &options).unwrap()
    }

    fn small_options() -> Options {
        Options {
            num_pages: 4096,
            num_page_table_entries: 256,
            max_requested_pages: 64,
            max_filled_pages: 64,
            max_stale_pages: 64,
            max_invalidated_pages: 64,
            arena_size: 4 * TILE_SIZE_IN_BYTES,
            ..Default::default()
        }
    }

    #[test]
    fn test_tile_block_desc_packing() {
        let desc = TileBlockDesc::new(7, 31, 2);
        assert_eq!(desc.arena_id(), 7);
        assert_eq!(desc.tile_id(), 31);
        assert_eq!(desc.num_tiles(), 2);
        assert!(desc.is_valid());
        assert!(!TileBlockDesc::default().is_valid());
        assert_eq!(TileBlockDesc(desc.0), desc);
    }

    #[test]
    fn test_alloc_first_fit() {
        let manager = manager(small_options());
        let a = manager.alloc_tile_block(1).unwrap().unwrap();
        let b = manager.alloc_tile_block(2).unwrap().unwrap();
        assert_eq!((a.desc.arena_id(), a.desc.tile_id()), (0, 0));
        assert_eq!((b.desc.arena_id(), b.desc.tile_id()), (0, 1));

        // Only one slot left in arena 0, so a 2-tile block opens arena 1
        let c = manager.alloc_tile_block(2).unwrap().unwrap();
        assert_eq!((c.desc.arena_id(), c.desc.tile_id()), (1, 0));
        let d = manager.alloc_tile_block(1).unwrap().unwrap();
        assert_eq!((d.desc.arena_id(), d.desc.tile_id()), (0, 3));

        manager.free_tile_block(b);
        let e = manager.alloc_tile_block(2).unwrap().unwrap();
        assert_eq!((e.desc.arena_id(), e.desc.tile_id()), (0, 1));
        assert_eq!(manager.num_arenas(), 2);

        assert_eq!(
            manager.tile_block_ptr(e.desc),
            manager.tile_block_ptr(a.desc).map(|ptr| ptr.offset(TILE_SIZE_IN_BYTES))
        );
    }

    #[test]
    fn test_oversized_block_is_an_error() {
        let manager = manager(small_options());
        assert!(matches!(
            manager.alloc_tile_block(5),
            Err(PagingError::TilePoolExhausted { num_tiles: 5, arena_tiles: 4 })
        ));
    }

    #[test]
    fn test_budget_limits_arenas() {
        let manager = manager(small_options());
        assert_eq!(manager.set_max_texture_tile_memory(4 * TILE_SIZE_IN_BYTES), 1);
        assert!(!manager.need_tile_blocks_freed());

        let blocks: Vec<_> = (0..4)
            .map(|_| manager.alloc_tile_block(1).unwrap().unwrap())
            .collect();
        assert!(manager.alloc_tile_block(1).unwrap().is_none());
        assert!(manager.need_tile_blocks_freed());

        manager.free_tile_block(blocks[2]);
        assert!(!manager.need_tile_blocks_freed());
        assert_eq!(manager.alloc_tile_block(1).unwrap().unwrap().desc, blocks[2].desc);

        // A tiny budget still allows one arena
        assert_eq!(manager.set_max_texture_tile_memory(1), 1);
        assert_eq!(manager.set_max_texture_tile_memory(0), 0);
        assert_eq!(manager.max_arenas(), None);
    }

    #[test]
    fn test_shrinking_retires_arenas() {
        let manager = manager(small_options());
        let handles: Vec<_> = (0..3)
            .map(|_| manager.alloc_tile_block(4).unwrap().unwrap())
            .collect();
        assert_eq!(manager.num_arenas(), 3);
        for handle in &handles {
            manager.finish_fill(*handle);
        }

        manager.set_max_texture_tile_memory(4 * TILE_SIZE_IN_BYTES);
        assert!(manager.is_live(handles[0]));
        assert!(!manager.is_live(handles[1]));
        assert!(!manager.is_live(handles[2]));

        assert_eq!(manager.release_retired_arenas().unwrap(), 2);
        assert_eq!(manager.num_arenas(), 1);
        assert_eq!(manager.tile_memory_used(), 4 * TILE_SIZE_IN_BYTES);
    }

    #[test]
    fn test_pending_fill_delays_release() {
        let manager = manager(small_options());
        let first = manager.alloc_tile_block(4).unwrap().unwrap();
        let second = manager.alloc_tile_block(4).unwrap().unwrap();
        manager.finish_fill(first);

        manager.set_max_texture_tile_memory(4 * TILE_SIZE_IN_BYTES);
        assert_eq!(manager.release_retired_arenas().unwrap(), 0);

        manager.finish_fill(second);
        assert_eq!(manager.release_retired_arenas().unwrap(), 1);

        // A recreated arena has a new epoch, so the old handle is stale
        manager.set_max_texture_tile_memory(0);
        let recreated = manager.alloc_tile_block(4).unwrap().unwrap();
        assert_eq!(recreated.desc.arena_id(), second.desc.arena_id());
        assert!(!manager.is_live(second));
        assert!(manager.is_live(recreated));

        // Freeing the stale handle does not touch the new arena
        manager.free_tile_block(second);
        assert!(manager.alloc_tile_block(1).unwrap().unwrap().desc.arena_id() > 1);
    }

    #[test]
    fn test_growing_budget_revives_retired_arenas() {
        let manager = manager(small_options());
        let _ = manager.alloc_tile_block(4).unwrap();
        let second = manager.alloc_tile_block(4).unwrap().unwrap();
        manager.set_max_texture_tile_memory(4 * TILE_SIZE_IN_BYTES);
        assert!(!manager.is_live(second));
        manager.set_max_texture_tile_memory(8 * TILE_SIZE_IN_BYTES);
        assert!(manager.is_live(second));
    }

    #[test]
    fn test_context_pool_reuses_slots() {
        let options = Options {
            max_active_streams: 1,
            ..small_options()
        };
        let manager = manager(options);
        let first = manager.allocate_device_context().unwrap();
        let second = manager.allocate_device_context().unwrap();
        assert_eq!(first.pool_index, 0);
        assert_eq!(second.pool_index, 1);
        assert_eq!(first.page_table, second.page_table);
        assert_ne!(first.request_bits, second.request_bits);
        assert_eq!(first.requested_pages.capacity, 64);
        assert_eq!(first.request_bits.capacity, 128);
        assert_eq!(manager.num_device_contexts_in_use(), 2);

        manager.free_device_context(first.pool_index);
        let third = manager.allocate_device_context().unwrap();
        assert_eq!(third, first);
        assert_eq!(manager.num_device_contexts_in_use(), 2);
    }

    #[test]
    fn test_sampler_slots_are_reused() {
        let manager = manager(small_options());
        let before = manager.memory_used();
        let a = manager.allocate_sampler().unwrap();
        let b = manager.allocate_sampler().unwrap();
        assert_ne!(a, b);
        manager.free_sampler(a);
        assert_eq!(manager.allocate_sampler().unwrap(), a);
        assert_eq!(manager.memory_used(), before + 2 * size_of::<TextureSampler>() as u64);
    }

    #[test]
    fn test_drop_frees_device_memory() {
        let device = Device::new(DeviceCapabilities::default());
        {
            let manager = DeviceMemoryManager::new(device.clone(), &small_options()).unwrap();
            manager.alloc_tile_block(1).unwrap();
            manager.allocate_device_context().unwrap();
            manager.allocate_sampler().unwrap();
            manager.allocate_dense(1000).unwrap();
            assert!(device.memory_used() > 0);
            assert_eq!(device.memory_used(), manager.memory_used());
        }
        assert_eq!(device.memory_used(), 0);
    }
}
