use std::sync::{Arc, Weak};

use texpage_platform::{DevicePtr, Stream};

use super::upgrade;
use crate::demand_loader::LoaderCore;
use crate::paging_system::NON_EVICTABLE_LRU_VAL;
use crate::request_processor::{FillOutcome, RequestHandler};
use crate::sampler::{is_base_color_id, page_id_to_sampler_id};
use crate::texture::DemandTexture;
use crate::{PagingError, PagingResult};

/// Fills the two pages of every texture id: the sampler page, mapped to a
/// device copy of the texture's sampler, and the base color page, whose
/// entry is the packed color itself
pub(crate) struct SamplerRequestHandler {
    core: Weak<LoaderCore>,
}

impl SamplerRequestHandler {
    pub fn new(core: Weak<LoaderCore>) -> Self {
        Self { core }
    }

    fn fill_sampler(&self, core: &Arc<LoaderCore>, stream: &Stream, page_id: u32) -> PagingResult<()> {
        let texture = core.texture(page_id_to_sampler_id(page_id))?;
        let mut sampler = core.init_texture_sampler(&texture)?;
        if !sampler.desc.is_sparse() {
            sampler.texture = load_dense_texture(core, &texture, stream)?.addr();
        }

        let dmm = core.page_loader.device_memory();
        let slot = dmm.allocate_sampler()?;
        let written = stream
            .memcpy_htod_async(slot, bytemuck::bytes_of(&sampler).to_vec())
            .and_then(|()| stream.record_event().synchronize());
        if let Err(err) = written {
            dmm.free_sampler(slot);
            return Err(err.into());
        }
        core.page_loader
            .paging_system()
            .add_mapping(page_id, NON_EVICTABLE_LRU_VAL, slot.addr());
        log::debug!("texture {}: sampler mapped at {}", texture.id(), slot);
        Ok(())
    }

    fn fill_base_color(&self, core: &Arc<LoaderCore>, page_id: u32) -> PagingResult<()> {
        let texture = core.texture(page_id_to_sampler_id(page_id))?;
        let color = texture.read_base_color()?;
        core.page_loader
            .paging_system()
            .add_mapping(page_id, NON_EVICTABLE_LRU_VAL, color);
        Ok(())
    }
}

impl RequestHandler for SamplerRequestHandler {
    fn fill_request(&self, stream: &Stream, page_id: u32) -> PagingResult<FillOutcome> {
        let Some(core) = upgrade(&self.core) else {
            return Ok(FillOutcome::Deferred);
        };
        if core.page_loader.paging_system().has_mapping(page_id) {
            return Ok(FillOutcome::Filled);
        }
        if is_base_color_id(page_id) {
            self.fill_base_color(&core, page_id)?;
        } else {
            self.fill_sampler(&core, stream, page_id)?;
        }
        Ok(FillOutcome::Filled)
    }

    fn name(&self) -> &str {
        "texture samplers"
    }
}

/// Upload every mip level of a dense texture, once per image.
///
/// Variants use the storage of their master.
fn load_dense_texture(
    core: &Arc<LoaderCore>,
    texture: &Arc<DemandTexture>,
    stream: &Stream,
) -> PagingResult<DevicePtr> {
    let owner = texture.master().unwrap_or(texture);
    let existing = owner.dense_storage();
    if !existing.is_null() {
        return Ok(existing);
    }

    let size = owner.mip_tail_size();
    let mut data = vec![0u8; size as usize];
    owner.read_all_levels(&mut data)?;

    let dmm = core.page_loader.device_memory();
    let storage = dmm.allocate_dense(size)?;
    let uploaded = stream
        .memcpy_htod_async(storage, data)
        .and_then(|()| stream.record_event().synchronize());
    if let Err(err) = uploaded {
        dmm.free_dense(storage)?;
        return Err(PagingError::Device(err));
    }

    let installed = owner.install_dense_storage(storage);
    if installed != storage {
        dmm.free_dense(storage)?;
    } else {
        core.record_transfer(size);
    }
    Ok(installed)
}
