//! Demand Loader
//!
//! Texture and resource level interface of the paging engine. Every texture
//! gets two page table entries (its sampler and its base color) and, once its
//! sampler is first requested, a range of tile pages. Resources are page
//! ranges filled by a user callback.
//!
//! ```text
//! create_texture ─► sampler page requested ─► image opened, tile pages reserved
//!                                                      │
//!               tile pages requested ◄─────────────────┘
//!                       │
//!                       └─► tile read, uploaded into an arena, mapped
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use texpage_image::ImageSource;
use texpage_platform::{Device, DevicePtr, Stream};

use crate::device_context::DeviceContext;
use crate::device_memory::TileBlockHandle;
use crate::handlers::{ResourceCallback, ResourceRequestHandler, SamplerRequestHandler, TextureRequestHandler};
use crate::options::Options;
use crate::page_loader::DemandPageLoader;
use crate::page_table::PageTableManager;
use crate::paging_system::InvalidationPredicate;
use crate::request_processor::{FillOutcome, RequestHandler, RequestProcessor};
use crate::sampler::{BASE_COLOR_OFFSET, PAGES_PER_TEXTURE, TextureSampler};
use crate::statistics::Statistics;
use crate::texture::{DemandTexture, TextureConfig, TextureDescriptor};
use crate::ticket::Ticket;
use crate::{PagingError, PagingResult};

/// State shared between the loader and its request handlers
pub(crate) struct LoaderCore {
    pub(crate) page_loader: DemandPageLoader,
    textures: RwLock<AHashMap<u32, Arc<DemandTexture>>>,
    texture_config: TextureConfig,
    bytes_transferred: AtomicU64,
}

impl LoaderCore {
    pub(crate) fn texture(&self, texture_id: u32) -> PagingResult<Arc<DemandTexture>> {
        self.textures
            .read()
            .get(&texture_id)
            .cloned()
            .ok_or(PagingError::UnknownTexture(texture_id))
    }

    /// Build the sampler of `texture`, reserving tile pages owned by the
    /// texture (or its master) on first use
    pub(crate) fn init_texture_sampler(
        self: &Arc<Self>,
        texture: &Arc<DemandTexture>,
    ) -> PagingResult<TextureSampler> {
        if let Some(sampler) = texture.sampler() {
            return Ok(sampler);
        }
        let owner = texture.master().unwrap_or(texture).clone();
        let mut reserve = |num_pages: u32| -> PagingResult<u32> {
            let handler: Arc<dyn RequestHandler> =
                Arc::new(TextureRequestHandler::new(Arc::downgrade(self), owner.clone()));
            self.page_loader
                .allocate_pages_with_handler(num_pages, false, Some(handler))
        };
        texture.init(self.texture_config, &mut reserve)
    }

    /// Allocate tile storage, evicting least recently used tiles while the
    /// budget is exhausted. `None` when nothing more can be evicted.
    pub(crate) fn alloc_tile_block(&self, num_tiles: u32) -> PagingResult<Option<TileBlockHandle>> {
        let dmm = self.page_loader.device_memory();
        let paging = self.page_loader.paging_system();
        loop {
            if let Some(handle) = dmm.alloc_tile_block(num_tiles)? {
                return Ok(Some(handle));
            }
            if paging.evict_lru_page().is_none() {
                log::debug!("no tile memory for {} tiles and nothing to evict", num_tiles);
                return Ok(None);
            }
        }
    }

    pub(crate) fn record_transfer(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Registry {
    /// First texture created from each image, keyed by image address
    image_textures: AHashMap<usize, u32>,
    num_resources: usize,
}

fn image_key(image: &Arc<dyn ImageSource>) -> usize {
    Arc::as_ptr(image) as *const () as usize
}

/// Demand loading of textures and resources on one device
pub struct DemandLoader {
    core: Arc<LoaderCore>,
    sampler_handler: Arc<SamplerRequestHandler>,
    registry: Mutex<Registry>,
    next_launch_id: AtomicU32,
    is_active: AtomicBool,
}

impl fmt::Debug for DemandLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemandLoader")
            .field("page_loader", &self.core.page_loader)
            .field("textures", &self.core.textures.read().len())
            .field("resources", &self.registry.lock().num_resources)
            .finish()
    }
}

impl DemandLoader {
    /// Create a loader and start its request workers
    pub fn new(device: Device, options: Options) -> PagingResult<Self> {
        options.validate()?;
        let page_table = Arc::new(Mutex::new(PageTableManager::new(
            options.num_pages,
            options.num_page_table_entries,
        )));
        let processor = Arc::new(RequestProcessor::new(page_table.clone()));
        let page_loader = DemandPageLoader::new(device, processor.clone(), page_table, options)?;

        let texture_config = TextureConfig {
            use_sparse_textures: page_loader.options().use_sparse_textures,
            tile_layout: page_loader.options().tile_layout,
            max_mip_tail_size: page_loader.options().arena_size,
        };
        let num_threads = page_loader.options().max_threads as usize;
        let core = Arc::new(LoaderCore {
            page_loader,
            textures: RwLock::new(AHashMap::new()),
            texture_config,
            bytes_transferred: AtomicU64::new(0),
        });
        let sampler_handler = Arc::new(SamplerRequestHandler::new(Arc::downgrade(&core)));

        processor.start(num_threads)?;
        log::info!(
            "demand loader ready: {} pages, {} page table entries, {} textures",
            core.page_loader.options().num_pages,
            core.page_loader.options().num_page_table_entries,
            if texture_config.use_sparse_textures { "sparse" } else { "dense" }
        );

        Ok(Self {
            core,
            sampler_handler,
            registry: Mutex::new(Registry::default()),
            next_launch_id: AtomicU32::new(0),
            is_active: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &Device {
        self.core.page_loader.device()
    }

    /// Options in effect, after device capability checks
    pub fn options(&self) -> &Options {
        self.core.page_loader.options()
    }

    pub fn page_loader(&self) -> &DemandPageLoader {
        &self.core.page_loader
    }

    /// Register a texture. Returns its texture id, the page id of its sampler.
    ///
    /// A texture created from an image that is already registered is a
    /// variant: it has its own sampler but shares the tile pages of the
    /// first texture made from that image.
    pub fn create_texture(
        &self,
        image: Arc<dyn ImageSource>,
        descriptor: TextureDescriptor,
    ) -> PagingResult<u32> {
        let mut registry = self.registry.lock();
        self.is_active.store(true, Ordering::Release);

        let texture_id = self.allocate_texture_pages()?;
        let texture = match registry.image_textures.get(&image_key(&image)).copied() {
            Some(master_id) => {
                log::debug!("texture {} is a variant of texture {}", texture_id, master_id);
                DemandTexture::new_variant(texture_id, self.core.texture(master_id)?, descriptor)
            }
            None => {
                registry.image_textures.insert(image_key(&image), texture_id);
                DemandTexture::new(texture_id, descriptor, image)
            }
        };
        self.core.textures.write().insert(texture_id, Arc::new(texture));
        Ok(texture_id)
    }

    /// Two backed pages for a texture id, aligned to [`PAGES_PER_TEXTURE`]
    fn allocate_texture_pages(&self) -> PagingResult<u32> {
        let handler: Arc<dyn RequestHandler> = self.sampler_handler.clone();
        let mut page_table = self.core.page_loader.page_table().lock();
        let start = page_table.reserve_backed_pages(PAGES_PER_TEXTURE, Some(handler.clone()))?;
        let misalignment = start % PAGES_PER_TEXTURE;
        if misalignment == 0 {
            return Ok(start);
        }
        let padding = PAGES_PER_TEXTURE - misalignment;
        page_table.reserve_backed_pages(padding, Some(handler))?;
        Ok(start + padding)
    }

    /// Register a resource of `num_pages` pages. Returns its first page id.
    pub fn create_resource(&self, num_pages: u32, callback: ResourceCallback) -> PagingResult<u32> {
        let mut registry = self.registry.lock();
        self.is_active.store(true, Ordering::Release);

        let handler: Arc<dyn RequestHandler> = Arc::new(ResourceRequestHandler::new(
            Arc::downgrade(&self.core),
            callback,
        ));
        let start_page = self
            .core
            .page_loader
            .allocate_pages_with_handler(num_pages, true, Some(handler))?;
        registry.num_resources += 1;
        Ok(start_page)
    }

    /// Push pending mappings and return the context for the next launch on `stream`
    pub fn launch_prepare(&self, stream: &Stream) -> PagingResult<DeviceContext> {
        self.core.page_loader.push_mappings(stream)
    }

    /// Pull the requests recorded by a launch with `context` and fill them
    /// asynchronously. The ticket completes when every request is resolved.
    pub fn process_requests(&self, stream: &Stream, context: &DeviceContext) -> PagingResult<Ticket> {
        if !self.is_active.load(Ordering::Acquire) {
            self.core
                .page_loader
                .device_memory()
                .free_device_context(context.pool_index);
            return Ok(Ticket::default());
        }

        let ticket = Ticket::new();
        let launch_id = self.next_launch_id.fetch_add(1, Ordering::Relaxed);
        self.core
            .page_loader
            .request_processor()
            .set_ticket(launch_id, ticket.clone());
        self.core.page_loader.pull_requests(stream, context, launch_id)?;
        Ok(ticket)
    }

    /// Fill pages requested outside a launch, e.g. recorded in an earlier session
    pub fn replay_requests(&self, stream: &Stream, pages: &[u32]) -> Ticket {
        let ticket = Ticket::new();
        let launch_id = self.next_launch_id.fetch_add(1, Ordering::Relaxed);
        self.core
            .page_loader
            .request_processor()
            .set_ticket(launch_id, ticket.clone());
        self.core.page_loader.replay_requests(stream, launch_id, pages);
        ticket
    }

    /// Unmap every tile of a texture and its base color at the next push.
    /// Variants share their tiles, so all of them lose the tiles.
    pub fn unload_texture_tiles(&self, texture_id: u32) -> PagingResult<()> {
        let texture = self.core.texture(texture_id)?;
        if !texture.is_open() {
            return Ok(());
        }

        let sampler = self.core.init_texture_sampler(&texture)?;
        let page_loader = &self.core.page_loader;
        if sampler.num_pages > 0 {
            page_loader.invalidate_page_range(
                sampler.start_page,
                sampler.start_page + sampler.num_pages,
                InvalidationPredicate::ReturnTileBlocks,
            );
        }
        let base_color_id = texture_id + BASE_COLOR_OFFSET;
        page_loader.invalidate_page_range(base_color_id, base_color_id + 1, InvalidationPredicate::All);
        Ok(())
    }

    /// Swap the image behind a texture. Its tiles are unloaded; when the new
    /// image differs in size, format or descriptor the sampler is rebuilt on
    /// its next request.
    pub fn replace_texture(
        &self,
        texture_id: u32,
        image: Arc<dyn ImageSource>,
        descriptor: TextureDescriptor,
    ) -> PagingResult<()> {
        self.unload_texture_tiles(texture_id)?;

        let mut registry = self.registry.lock();
        let texture = self.core.texture(texture_id)?;
        let old_key = image_key(&texture.image());
        let new_key = image_key(&image);
        let sampler_needs_reset = texture.set_image(descriptor, image)?;

        if registry.image_textures.get(&old_key) == Some(&texture_id) {
            registry.image_textures.remove(&old_key);
        }
        registry.image_textures.entry(new_key).or_insert(texture_id);

        // Dense storage holds the old pixels; it is dropped with the sampler
        let dense_storage = match texture.master() {
            Some(_) => DevicePtr::NULL,
            None => texture.take_dense_storage(),
        };

        let predicate = if !dense_storage.is_null() {
            let dmm = self.core.page_loader.device_memory().clone();
            let mut dense_storage = Some(dense_storage);
            InvalidationPredicate::Custom(Box::new(move |_page_id, entry, _stream| {
                if entry != 0 {
                    dmm.free_sampler(DevicePtr(entry));
                }
                if let Some(storage) = dense_storage.take() {
                    if let Err(err) = dmm.free_dense(storage) {
                        log::warn!("failed to free dense storage {}: {}", storage, err);
                    }
                }
                true
            }))
        } else if sampler_needs_reset {
            InvalidationPredicate::ReturnSampler
        } else {
            return Ok(());
        };
        self.core
            .page_loader
            .invalidate_page_range(texture_id, texture_id + 1, predicate);
        Ok(())
    }

    /// Fill the sampler and base color pages of a texture now, on `stream`
    pub fn init_texture(&self, stream: &Stream, texture_id: u32) -> PagingResult<()> {
        self.core.texture(texture_id)?;
        self.sampler_handler.fill_request(stream, texture_id)?;
        self.sampler_handler
            .fill_request(stream, texture_id + BASE_COLOR_OFFSET)?;
        Ok(())
    }

    /// Load one tile now, on `stream`. Returns whether it was mapped.
    pub fn load_texture_tile(
        &self,
        stream: &Stream,
        texture_id: u32,
        mip_level: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> PagingResult<bool> {
        let texture = self.core.texture(texture_id)?;
        let sampler = self.core.init_texture_sampler(&texture)?;
        if sampler.num_pages == 0 {
            return Ok(false);
        }
        let page_id = self
            .texture_tile_page_id(texture_id, mip_level, tile_x, tile_y)?
            .ok_or(PagingError::UnknownTexture(texture_id))?;
        let owner = texture.master().unwrap_or(&texture).clone();
        let handler = TextureRequestHandler::new(Arc::downgrade(&self.core), owner);
        Ok(handler.load_page(stream, page_id)? == FillOutcome::Filled)
    }

    /// Page id of a tile, or `None` for dense textures and textures not
    /// initialized yet. Levels in the mip tail map to the tail page.
    pub fn texture_tile_page_id(
        &self,
        texture_id: u32,
        mip_level: u32,
        tile_x: u32,
        tile_y: u32,
    ) -> PagingResult<Option<u32>> {
        Ok(self.core.texture(texture_id)?.tile_page_id(mip_level, tile_x, tile_y))
    }

    /// First mip level packed into the mip tail, once the texture is initialized
    pub fn mip_tail_first_level(&self, texture_id: u32) -> PagingResult<Option<u32>> {
        let texture = self.core.texture(texture_id)?;
        Ok(texture.sampler().map(|sampler| sampler.mip_tail_first_level))
    }

    /// Sampler of a texture, once initialized
    pub fn texture_sampler(&self, texture_id: u32) -> PagingResult<Option<TextureSampler>> {
        Ok(self.core.texture(texture_id)?.sampler())
    }

    pub fn page_resident(&self, page_id: u32) -> bool {
        self.core.page_loader.paging_system().is_resident(page_id)
    }

    /// Change the tile memory budget; 0 is unlimited
    pub fn set_max_texture_memory(&self, max_bytes: u64) {
        self.core.page_loader.set_max_texture_memory(max_bytes);
    }

    pub fn enable_eviction(&self, active: bool) {
        self.core.page_loader.enable_eviction(active);
    }

    pub fn statistics(&self) -> Statistics {
        let page_loader = &self.core.page_loader;
        let paging = page_loader.paging_system();
        let textures = self.core.textures.read();

        let mut stats = Statistics {
            request_processing_time: page_loader.total_processing_time(),
            fill_time: page_loader.request_processor().total_processing_time(),
            num_textures: textures.len(),
            memory_used: page_loader.device_memory().memory_used(),
            bytes_transferred: self.core.bytes_transferred.load(Ordering::Relaxed),
            num_evictions: paging.num_evictions(),
            num_resident_pages: paging.num_resident_pages(),
            ..Default::default()
        };
        let mut seen = Vec::new();
        for texture in textures.values() {
            texture.accumulate_statistics(&mut stats, &mut seen);
        }
        stats
    }

    /// Stop the request workers; queued requests are dropped
    pub fn abort(&self) {
        self.core.page_loader.request_processor().stop();
    }
}

impl Drop for DemandLoader {
    fn drop(&mut self) {
        // Workers may hold the core; they must finish before it goes away
        self.core.page_loader.request_processor().stop();
    }
}
