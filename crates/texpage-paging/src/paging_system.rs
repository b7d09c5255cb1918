//! Paging System
//!
//! Host-side residency and LRU state of every page, and the push/pull
//! protocol that keeps the device view in sync with it.
//!
//! Page states:
//! ```text
//! Unmapped ─► Requested ─► Resident ─► Evicting ─► Unmapped
//! ```
//! A page is Requested while the request processor fills it, Resident once
//! its mapping has been flushed, and Evicting between the removal from the
//! resident table and the push that clears it on the device.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet;
use parking_lot::Mutex;
use texpage_platform::{DevicePtr, Stream};

use crate::PagingResult;
use crate::device_context::{DeviceContext, DevicePageMapping, StalePage, array_length};
use crate::device_memory::{DeviceMemoryManager, TileBlockDesc, TileBlockHandle};
use crate::kernels;
use crate::options::Options;
use crate::request_processor::RequestProcessor;

/// Highest LRU value of an evictable page
pub const MAX_LRU_VAL: u32 = 14;

/// LRU value of pinned pages
pub const NON_EVICTABLE_LRU_VAL: u32 = 15;

/// Page table update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    pub page_id: u32,
    pub lru_val: u32,
    pub entry: u64,
}

impl From<PageMapping> for DevicePageMapping {
    fn from(mapping: PageMapping) -> Self {
        Self {
            page_id: mapping.page_id,
            lru_val: mapping.lru_val,
            entry: mapping.entry,
        }
    }
}

/// Storage behind a resident page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    /// Caller-owned entry (sampler address, base color, resource value)
    Fixed,
    /// Tile block owned by the device memory manager
    TileBlock(TileBlockHandle),
}

#[derive(Debug, Clone, Copy)]
struct ResidentPage {
    entry: u64,
    lru_val: u32,
    backing: Backing,
}

/// Decides which resident pages of an invalidation range are unmapped
pub enum InvalidationPredicate {
    /// Every resident page
    All,
    /// Tile pages stored in arenas `>= max_arenas`; their storage goes away with the arena
    ArenaThreshold { max_arenas: u32 },
    /// The listed pages
    Pages(AHashSet<u32>),
    /// Every tile page, returning its block to the pool
    ReturnTileBlocks,
    /// Every sampler page, returning its slot to the pool
    ReturnSampler,
    /// Caller-supplied test on `(page_id, entry, stream)`
    Custom(Box<dyn FnMut(u32, u64, &Stream) -> bool + Send>),
}

impl fmt::Debug for InvalidationPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::ArenaThreshold { max_arenas } => write!(f, "ArenaThreshold({max_arenas})"),
            Self::Pages(pages) => write!(f, "Pages({})", pages.len()),
            Self::ReturnTileBlocks => write!(f, "ReturnTileBlocks"),
            Self::ReturnSampler => write!(f, "ReturnSampler"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl InvalidationPredicate {
    fn matches(&mut self, page_id: u32, page: &ResidentPage, stream: &Stream) -> bool {
        match self {
            Self::All | Self::ReturnSampler => true,
            Self::ArenaThreshold { max_arenas } => matches!(
                page.backing,
                Backing::TileBlock(handle) if handle.desc.arena_id() >= *max_arenas
            ),
            Self::Pages(pages) => pages.contains(&page_id),
            Self::ReturnTileBlocks => matches!(page.backing, Backing::TileBlock(_)),
            Self::Custom(predicate) => predicate(page_id, page.entry, stream),
        }
    }
}

#[derive(Default)]
struct PagingState {
    resident: BTreeMap<u32, ResidentPage>,
    /// Mappings not yet pushed
    filled: Vec<PageMapping>,
    /// Unmapped pages not yet pushed
    invalidated: Vec<u32>,
    num_evictions: u64,
}

impl PagingState {
    fn unmap(&mut self, page_id: u32) -> Option<ResidentPage> {
        let page = self.resident.remove(&page_id)?;
        self.filled.retain(|mapping| mapping.page_id != page_id);
        self.invalidated.push(page_id);
        Some(page)
    }
}

/// Residency bookkeeping and device synchronization
pub struct PagingSystem {
    num_page_table_entries: u32,
    use_lru_table: bool,
    dmm: Arc<DeviceMemoryManager>,
    state: Mutex<PagingState>,
    pending: Mutex<Vec<(PageMapping, Backing)>>,
    eviction_active: AtomicBool,
}

impl fmt::Debug for PagingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PagingSystem")
            .field("resident", &state.resident.len())
            .field("filled", &state.filled.len())
            .field("invalidated", &state.invalidated.len())
            .field("num_evictions", &state.num_evictions)
            .finish()
    }
}

impl PagingSystem {
    pub fn new(options: &Options, dmm: Arc<DeviceMemoryManager>) -> Self {
        Self {
            num_page_table_entries: options.num_page_table_entries,
            use_lru_table: options.use_lru_table,
            dmm,
            state: Mutex::new(PagingState::default()),
            pending: Mutex::new(Vec::new()),
            eviction_active: AtomicBool::new(options.eviction_active),
        }
    }

    /// Buffer a mapping with a caller-owned entry
    pub fn add_mapping(&self, page_id: u32, lru_val: u32, entry: u64) {
        self.pending.lock().push((PageMapping { page_id, lru_val, entry }, Backing::Fixed));
    }

    /// Buffer a mapping of a tile page to a filled tile block
    pub fn add_tile_mapping(&self, page_id: u32, handle: TileBlockHandle) {
        let mapping = PageMapping {
            page_id,
            lru_val: 0,
            entry: handle.desc.0,
        };
        self.pending.lock().push((mapping, Backing::TileBlock(handle)));
    }

    /// Move buffered mappings into the resident table
    pub fn flush_mappings(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
    }

    fn flush_locked(&self, state: &mut PagingState) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (mapping, backing) in pending {
            let page_id = mapping.page_id;
            if let Backing::TileBlock(handle) = backing {
                if !self.dmm.is_live(handle) {
                    log::debug!("dropping mapping of page {} into a retired arena", page_id);
                    self.dmm.free_tile_block(handle);
                    continue;
                }
            }
            if state.resident.contains_key(&page_id) {
                log::debug!("page {} is already resident; dropping duplicate mapping", page_id);
                if let Backing::TileBlock(handle) = backing {
                    self.dmm.free_tile_block(handle);
                }
                continue;
            }

            state.resident.insert(
                page_id,
                ResidentPage {
                    entry: mapping.entry,
                    lru_val: mapping.lru_val,
                    backing,
                },
            );
            state.invalidated.retain(|&page| page != page_id);
            state.filled.push(mapping);
        }
    }

    /// Resident, or filled and waiting for a flush
    pub fn has_mapping(&self, page_id: u32) -> bool {
        let state = self.state.lock();
        state.resident.contains_key(&page_id)
            || self
                .pending
                .lock()
                .iter()
                .any(|(mapping, _)| mapping.page_id == page_id)
    }

    pub fn is_resident(&self, page_id: u32) -> bool {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
        state.resident.contains_key(&page_id)
    }

    /// Entry of a resident page
    pub fn resident_entry(&self, page_id: u32) -> Option<u64> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
        state.resident.get(&page_id).map(|page| page.entry)
    }

    /// Host LRU value of a resident page
    pub fn lru_val(&self, page_id: u32) -> Option<u32> {
        self.state.lock().resident.get(&page_id).map(|page| page.lru_val)
    }

    pub fn num_resident_pages(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// Unmapped pages not yet pushed to the device
    pub fn num_pending_invalidations(&self) -> usize {
        self.state.lock().invalidated.len()
    }

    /// Flush, then drop the pages that are already resident
    pub fn filter_requests(&self, pages: &[u32]) -> Vec<u32> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
        pages
            .iter()
            .copied()
            .filter(|page_id| !state.resident.contains_key(page_id))
            .collect()
    }

    /// Write the pending mapping changes into `context` and run the push kernel.
    ///
    /// Clears the request bits of the context for the next launch. Changes
    /// beyond the context capacities stay queued for the next push.
    pub fn push_mappings(&self, context: &DeviceContext, stream: &Stream) -> PagingResult<()> {
        let _span = tracing::debug_span!("push_mappings", context = context.pool_index).entered();
        let (filled, invalidated) = {
            let mut state = self.state.lock();
            self.flush_locked(&mut state);
            let num_filled = state.filled.len().min(context.filled_pages.capacity as usize);
            let num_invalidated = state
                .invalidated
                .len()
                .min(context.invalidated_pages.capacity as usize);
            let filled: Vec<DevicePageMapping> = state
                .filled
                .drain(..num_filled)
                .map(DevicePageMapping::from)
                .collect();
            let invalidated: Vec<u32> = state.invalidated.drain(..num_invalidated).collect();
            (filled, invalidated)
        };

        let mut lengths = [0u32; array_length::COUNT];
        lengths[array_length::FILLED] = filled.len() as u32;
        lengths[array_length::INVALIDATED] = invalidated.len() as u32;
        log::trace!(
            "pushing {} mappings and {} invalidations",
            filled.len(),
            invalidated.len()
        );

        if !filled.is_empty() {
            stream.memcpy_htod_async(
                context.filled_pages.device_ptr(),
                bytemuck::cast_slice(&filled).to_vec(),
            )?;
        }
        if !invalidated.is_empty() {
            stream.memcpy_htod_async(
                context.invalidated_pages.device_ptr(),
                bytemuck::cast_slice(&invalidated).to_vec(),
            )?;
        }
        stream.memcpy_htod_async(
            context.array_lengths.device_ptr(),
            bytemuck::cast_slice(&lengths).to_vec(),
        )?;
        kernels::launch_push_mappings(stream, *context)?;
        stream.memset_async(
            context.request_bits.device_ptr(),
            0,
            context.request_bits.capacity as usize * size_of::<u32>(),
        )?;
        Ok(())
    }

    /// Run the pull kernel over `[start_page, end_page)` and forward the
    /// requests of the launch to `processor` once it has executed.
    ///
    /// The context returns to the pool when the callback is done.
    pub fn pull_requests(
        self: &Arc<Self>,
        processor: &Arc<RequestProcessor>,
        context: &DeviceContext,
        stream: &Stream,
        launch_id: u32,
        start_page: u32,
        end_page: u32,
    ) -> PagingResult<()> {
        let _span = tracing::debug_span!("pull_requests", launch_id).entered();
        kernels::launch_pull_requests(stream, *context, start_page, end_page)?;

        let paging = self.clone();
        let processor = processor.clone();
        let context = *context;
        let callback_stream = stream.clone();
        stream.launch_host_func(move || {
            let pages = match paging.read_pull_results(&context, &callback_stream) {
                Ok(pages) => pages,
                Err(err) => {
                    log::error!("failed to read requests of launch {}: {}", launch_id, err);
                    Vec::new()
                }
            };
            processor.add_requests(&callback_stream, launch_id, &pages);
            paging.dmm.free_device_context(context.pool_index);
        })?;
        Ok(())
    }

    fn read_pull_results(&self, context: &DeviceContext, stream: &Stream) -> PagingResult<Vec<u32>> {
        let device = stream.device();
        let lengths: [u32; array_length::COUNT] =
            device.read_value(context.array_lengths.device_ptr())?;
        let requested: Vec<u32> = device.read_vec(
            context.requested_pages.device_ptr(),
            lengths[array_length::REQUESTED] as usize,
        )?;
        let stale: Vec<StalePage> = device.read_vec(
            context.stale_pages.device_ptr(),
            lengths[array_length::STALE] as usize,
        )?;

        self.update_lru(&requested, &stale, context.use_lru_table());
        Ok(self.filter_requests(&requested))
    }

    /// Refresh the host LRU mirror after a launch
    fn update_lru(&self, requested: &[u32], stale: &[StalePage], from_device: bool) {
        let mut state = self.state.lock();
        if from_device {
            for page in stale {
                match state.resident.get_mut(&page.page_id) {
                    Some(resident) if resident.lru_val != NON_EVICTABLE_LRU_VAL => {
                        resident.lru_val = page.lru_val;
                    }
                    _ => {}
                }
            }
        } else {
            for resident in state.resident.values_mut() {
                if resident.lru_val < MAX_LRU_VAL {
                    resident.lru_val += 1;
                }
            }
        }
        for page_id in requested {
            match state.resident.get_mut(page_id) {
                Some(resident) if resident.lru_val != NON_EVICTABLE_LRU_VAL => resident.lru_val = 0,
                _ => {}
            }
        }
    }

    /// Unmap the resident pages of `[start_page, end_page)` matching `predicate`.
    ///
    /// Returns the number of pages unmapped; the device sees the change on the next push.
    pub fn invalidate_pages(
        &self,
        start_page: u32,
        end_page: u32,
        mut predicate: InvalidationPredicate,
        stream: &Stream,
    ) -> usize {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);

        let matches: Vec<u32> = state
            .resident
            .range(start_page..end_page)
            .filter(|&(&page_id, page)| predicate.matches(page_id, page, stream))
            .map(|(&page_id, _)| page_id)
            .collect();

        for &page_id in &matches {
            let Some(page) = state.unmap(page_id) else {
                continue;
            };
            match (&predicate, page.backing) {
                (InvalidationPredicate::ArenaThreshold { .. }, _) => {}
                (InvalidationPredicate::ReturnSampler, Backing::Fixed) if page.entry != 0 => {
                    self.dmm.free_sampler(DevicePtr(page.entry));
                }
                (_, Backing::TileBlock(handle)) => self.dmm.free_tile_block(handle),
                _ => {}
            }
        }
        log::debug!(
            "invalidated {} pages of [{}, {}) with {:?}",
            matches.len(),
            start_page,
            end_page,
            predicate
        );
        matches.len()
    }

    /// Unmap the least recently used evictable tile page and free its block.
    ///
    /// Ties go to the lowest page id. Returns `None` when eviction is
    /// disabled or nothing is evictable.
    pub fn evict_lru_page(&self) -> Option<PageMapping> {
        if !self.eviction_active() {
            return None;
        }
        let mut state = self.state.lock();
        self.flush_locked(&mut state);

        let mut victim: Option<(u32, u32)> = None;
        for (&page_id, page) in state.resident.range(self.num_page_table_entries..) {
            if page.lru_val == NON_EVICTABLE_LRU_VAL || !matches!(page.backing, Backing::TileBlock(_)) {
                continue;
            }
            if victim.is_none_or(|(_, lru_val)| page.lru_val > lru_val) {
                victim = Some((page_id, page.lru_val));
            }
        }

        let (page_id, _) = victim?;
        let page = state.unmap(page_id)?;
        if let Backing::TileBlock(handle) = page.backing {
            self.dmm.free_tile_block(handle);
        }
        state.num_evictions += 1;
        log::trace!("evicted page {} (lru {})", page_id, page.lru_val);
        Some(PageMapping {
            page_id,
            lru_val: page.lru_val,
            entry: page.entry,
        })
    }

    pub fn activate_eviction(&self, active: bool) {
        self.eviction_active.store(active, Ordering::Release);
    }

    pub fn eviction_active(&self) -> bool {
        self.eviction_active.load(Ordering::Acquire)
    }

    pub fn use_lru_table(&self) -> bool {
        self.use_lru_table
    }

    pub fn num_evictions(&self) -> u64 {
        self.state.lock().num_evictions
    }

    /// Tile block descriptor of a resident tile page
    pub fn tile_block(&self, page_id: u32) -> Option<TileBlockDesc> {
        match self.state.lock().resident.get(&page_id)?.backing {
            Backing::TileBlock(handle) => Some(handle.desc),
            Backing::Fixed => None,
        }
    }
}
