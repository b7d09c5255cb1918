//! Demand Page Loader
//!
//! Per-launch driver of the paging engine. Before a launch it drains the
//! queued invalidations and pushes the pending mappings into a fresh device
//! context; after the launch it pulls the requests of that context and hands
//! them to the request processor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use texpage_platform::{Device, PinnedMemoryPool, Stream, TimeAccumulator};

use crate::PagingResult;
use crate::device_context::{ContextFlags, DeviceContext};
use crate::device_memory::DeviceMemoryManager;
use crate::options::Options;
use crate::page_table::PageTableManager;
use crate::paging_system::{InvalidationPredicate, NON_EVICTABLE_LRU_VAL, PagingSystem};
use crate::request_processor::{RequestHandler, RequestProcessor};

struct InvalidationRange {
    start_page: u32,
    end_page: u32,
    predicate: InvalidationPredicate,
}

/// Orchestrates push, pull and invalidation for one device
pub struct DemandPageLoader {
    device: Device,
    options: Options,
    dmm: Arc<DeviceMemoryManager>,
    paging: Arc<PagingSystem>,
    processor: Arc<RequestProcessor>,
    page_table: Arc<Mutex<PageTableManager>>,
    pinned: Arc<PinnedMemoryPool>,
    invalidations: Mutex<Vec<InvalidationRange>>,
    max_tex_mem_per_device: AtomicU64,
    processing_time: TimeAccumulator,
}

impl fmt::Debug for DemandPageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemandPageLoader")
            .field("device", &self.device)
            .field("paging", &self.paging)
            .field("dmm", &self.dmm)
            .field("pending_invalidations", &self.invalidations.lock().len())
            .finish()
    }
}

impl DemandPageLoader {
    /// Create the loader. Sparse textures are turned off when the device
    /// cannot back them.
    pub fn new(
        device: Device,
        processor: Arc<RequestProcessor>,
        page_table: Arc<Mutex<PageTableManager>>,
        mut options: Options,
    ) -> PagingResult<Self> {
        options.validate()?;

        let capabilities = device.capabilities();
        if options.use_sparse_textures && (!capabilities.sparse_arrays || capabilities.tcc_driver) {
            log::info!(
                "device '{}' does not support sparse textures (sparse arrays: {}, TCC driver: {}); using dense textures",
                capabilities.name,
                capabilities.sparse_arrays,
                capabilities.tcc_driver
            );
            options.use_sparse_textures = false;
        }

        let dmm = Arc::new(DeviceMemoryManager::new(device.clone(), &options)?);
        let paging = Arc::new(PagingSystem::new(&options, dmm.clone()));
        let pinned = Arc::new(PinnedMemoryPool::new(options.max_pinned_memory as usize)?);

        Ok(Self {
            device,
            max_tex_mem_per_device: AtomicU64::new(options.max_tex_mem_per_device),
            options,
            dmm,
            paging,
            processor,
            page_table,
            pinned,
            invalidations: Mutex::new(Vec::new()),
            processing_time: TimeAccumulator::new(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Options after capability checks
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn device_memory(&self) -> &Arc<DeviceMemoryManager> {
        &self.dmm
    }

    pub fn paging_system(&self) -> &Arc<PagingSystem> {
        &self.paging
    }

    pub fn request_processor(&self) -> &Arc<RequestProcessor> {
        &self.processor
    }

    pub fn page_table(&self) -> &Arc<Mutex<PageTableManager>> {
        &self.page_table
    }

    pub fn pinned_memory(&self) -> &Arc<PinnedMemoryPool> {
        &self.pinned
    }

    /// Reserve `num_pages` pages; backed pages get page table entries
    pub fn allocate_pages(&self, num_pages: u32, backed: bool) -> PagingResult<u32> {
        self.allocate_pages_with_handler(num_pages, backed, None)
    }

    /// Reserve `num_pages` pages whose requests go to `handler`
    pub fn allocate_pages_with_handler(
        &self,
        num_pages: u32,
        backed: bool,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> PagingResult<u32> {
        let mut page_table = self.page_table.lock();
        if backed {
            page_table.reserve_backed_pages(num_pages, handler)
        } else {
            page_table.reserve_unbacked_pages(num_pages, handler)
        }
    }

    /// Map a page to a caller-owned entry
    pub fn set_page_table_entry(&self, page_id: u32, evictable: bool, entry: u64) {
        let lru_val = if evictable { 0 } else { NON_EVICTABLE_LRU_VAL };
        self.paging.add_mapping(page_id, lru_val, entry);
    }

    /// Prepare a device context for the next launch on `stream`
    pub fn push_mappings(&self, stream: &Stream) -> PagingResult<DeviceContext> {
        let mut context = self.dmm.allocate_device_context()?;

        let invalidations = std::mem::take(&mut *self.invalidations.lock());
        for range in invalidations {
            self.paging
                .invalidate_pages(range.start_page, range.end_page, range.predicate, stream);
        }

        let mut flags = ContextFlags::empty();
        flags.set(ContextFlags::REQUEST_IF_RESIDENT, self.paging.eviction_active());
        flags.set(ContextFlags::USE_LRU_TABLE, self.options.use_lru_table);
        context.set_flags(flags);

        self.paging.push_mappings(&context, stream)?;
        // Retired arenas may still back pages the device sees as resident
        // until every queued invalidation has been pushed
        if self.paging.num_pending_invalidations() == 0 {
            self.dmm.release_retired_arenas()?;
        }
        Ok(context)
    }

    /// Pull the requests of a finished launch and queue them under `launch_id`
    pub fn pull_requests(
        &self,
        stream: &Stream,
        context: &DeviceContext,
        launch_id: u32,
    ) -> PagingResult<()> {
        let end_page = self.page_table.lock().end_page();
        self.processing_time.time(|| {
            self.paging
                .pull_requests(&self.processor, context, stream, launch_id, 0, end_page)
        })
    }

    /// Queue pages requested outside a launch
    pub fn replay_requests(&self, stream: &Stream, launch_id: u32, pages: &[u32]) {
        let pages = self.paging.filter_requests(pages);
        self.processor.add_requests(stream, launch_id, &pages);
    }

    /// Change the tile memory budget. Tiles in arenas beyond the new budget
    /// are unmapped at the next push, and the arenas deleted after it.
    pub fn set_max_texture_memory(&self, max_bytes: u64) {
        let max_arenas = self.dmm.set_max_texture_tile_memory(max_bytes);
        if max_arenas > 0 {
            self.invalidate_page_range(
                self.options.num_page_table_entries,
                self.options.num_pages,
                InvalidationPredicate::ArenaThreshold { max_arenas },
            );
        }
        self.max_tex_mem_per_device.store(max_bytes, Ordering::Relaxed);
    }

    /// Current tile memory budget in bytes; 0 is unlimited
    pub fn max_texture_memory(&self) -> u64 {
        self.max_tex_mem_per_device.load(Ordering::Relaxed)
    }

    /// Queue an invalidation drained by the next push
    pub fn invalidate_page_range(&self, start_page: u32, end_page: u32, predicate: InvalidationPredicate) {
        log::debug!("queued invalidation of [{}, {}) with {:?}", start_page, end_page, predicate);
        self.invalidations.lock().push(InvalidationRange {
            start_page,
            end_page,
            predicate,
        });
    }

    pub fn enable_eviction(&self, active: bool) {
        self.paging.activate_eviction(active);
    }

    /// Time spent in [`Self::pull_requests`]
    pub fn total_processing_time(&self) -> Duration {
        self.processing_time.total()
    }
}
