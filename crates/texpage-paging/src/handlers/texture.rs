use std::sync::{Arc, Weak};

use texpage_platform::Stream;

use super::upgrade;
use crate::demand_loader::LoaderCore;
use crate::device_memory::TILE_SIZE_IN_BYTES;
use crate::request_processor::{FillOutcome, RequestHandler};
use crate::texture::DemandTexture;
use crate::tile_indexing::is_mip_tail_index;
use crate::{PagingError, PagingResult};

/// Fills the tile pages of one texture: tiles of the finer levels, and the
/// packed mip tail in the first page
pub(crate) struct TextureRequestHandler {
    core: Weak<LoaderCore>,
    texture: Arc<DemandTexture>,
    name: String,
}

impl TextureRequestHandler {
    pub fn new(core: Weak<LoaderCore>, texture: Arc<DemandTexture>) -> Self {
        let name = format!("texture {}", texture.id());
        Self { core, texture, name }
    }

    /// Read the tile or mip tail behind `page_id` and map it
    pub fn load_page(&self, stream: &Stream, page_id: u32) -> PagingResult<FillOutcome> {
        let Some(core) = upgrade(&self.core) else {
            return Ok(FillOutcome::Deferred);
        };
        let paging = core.page_loader.paging_system();
        if paging.has_mapping(page_id) {
            return Ok(FillOutcome::Filled);
        }

        let sampler = core.init_texture_sampler(&self.texture)?;
        if page_id < sampler.start_page || page_id >= sampler.start_page + sampler.num_pages {
            return Err(PagingError::UnknownPage(page_id));
        }
        let tile_index = page_id - sampler.start_page;
        let mip_tail = sampler.has_mip_tail() && is_mip_tail_index(tile_index);

        let num_bytes = if mip_tail {
            self.texture.mip_tail_size() as usize
        } else {
            let tile = sampler.tile_size();
            (tile.x * tile.y * self.texture.info().pixel_size()) as usize
        };
        let num_tiles = num_bytes.div_ceil(TILE_SIZE_IN_BYTES as usize).max(1);

        let mut staging = core.page_loader.pinned_memory().alloc(num_bytes)?;
        if mip_tail {
            self.texture.read_mip_tail(staging.as_mut_slice())?;
        } else {
            let coord = sampler.unpack_tile_index(tile_index);
            self.texture.read_tile(coord, staging.as_mut_slice())?;
        }

        let Some(handle) = core.alloc_tile_block(num_tiles as u32)? else {
            return Ok(FillOutcome::Deferred);
        };
        let dmm = core.page_loader.device_memory();
        let Some(dst) = dmm.tile_block_ptr(handle.desc) else {
            // arena deleted under us; the page will be requested again
            dmm.free_tile_block(handle);
            return Ok(FillOutcome::Deferred);
        };

        let uploaded = staging
            .upload_async(dst, stream)
            .and_then(|()| stream.record_event().synchronize());
        if let Err(err) = uploaded {
            dmm.free_tile_block(handle);
            dmm.finish_fill(handle);
            return Err(err.into());
        }
        paging.add_tile_mapping(page_id, handle);
        dmm.finish_fill(handle);
        core.record_transfer(num_bytes as u64);

        log::trace!(
            "texture {}: page {} ({}) -> arena {} tile {}",
            self.texture.id(),
            page_id,
            if mip_tail { "mip tail" } else { "tile" },
            handle.desc.arena_id(),
            handle.desc.tile_id()
        );
        Ok(FillOutcome::Filled)
    }
}

impl RequestHandler for TextureRequestHandler {
    fn fill_request(&self, stream: &Stream, page_id: u32) -> PagingResult<FillOutcome> {
        self.load_page(stream, page_id)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
