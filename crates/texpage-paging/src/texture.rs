//! Demand Textures
//!
//! Host-side record of a registered texture: its image, sampling descriptor
//! and the sampler built when the texture is first requested. Textures that
//! share an image are variants of the first texture created from it and reuse
//! its tile pages.

use std::sync::Arc;

use glam::UVec2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use texpage_image::{ImageSource, TextureInfo, Tile, texture_size_in_bytes};
use texpage_platform::DevicePtr;

use crate::PagingResult;
use crate::device_memory::TILE_SIZE_IN_BYTES;
use crate::sampler::{MAX_TILE_LEVELS, TextureSampler, build_mip_level_sizes};
use crate::statistics::Statistics;
use crate::tile_indexing::{AddressMode, TileCoord, TileLayout};

/// Page table entry of a base color page whose image has no base color
pub const NO_BASE_COLOR: u64 = u64::MAX;

/// Tile size reported for dense textures, which have no tiles
const DENSE_TILE_SIZE: UVec2 = UVec2::splat(64);

/// How a texture is sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureDescriptor {
    pub address_mode: [AddressMode; 2],
    pub mipmap_filter_linear: bool,
    pub max_anisotropy: u32,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            address_mode: [AddressMode::Clamp; 2],
            mipmap_filter_linear: true,
            max_anisotropy: 16,
        }
    }
}

/// Tile shape of a sparse texture: 64 KiB of pixels, as square as a power of
/// two allows, wider than tall otherwise
pub fn sparse_tile_size(pixel_size: u32) -> UVec2 {
    let pixels = TILE_SIZE_IN_BYTES as u32 / pixel_size.clamp(1, 16).next_power_of_two();
    let width = 1 << pixels.ilog2().div_ceil(2);
    UVec2::new(width, pixels / width)
}

/// First mip level narrower or shorter than a tile. Levels from there on are
/// packed into the mip tail page; a texture without such a level has no tail.
pub fn mip_tail_first_level(info: &TextureInfo, tile: UVec2) -> u32 {
    let first_small = (0..info.num_mip_levels)
        .find(|&level| {
            let dims = info.level_dims(level);
            dims.x < tile.x || dims.y < tile.y
        })
        .unwrap_or(info.num_mip_levels);
    first_small.min(MAX_TILE_LEVELS as u32 - 1).min(info.num_mip_levels)
}

/// Pack a linear RGBA color as four unorm16 channels, red in the low bits
pub fn pack_base_color(color: [f32; 4]) -> u64 {
    color.iter().enumerate().fold(0u64, |packed, (channel, value)| {
        let unorm = (value.clamp(0.0, 1.0) * 65535.0).round() as u64;
        packed | (unorm << (16 * channel))
    })
}

/// How `init` lays out a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TextureConfig {
    pub use_sparse_textures: bool,
    pub tile_layout: TileLayout,
    /// Largest mip tail a sparse texture may have; its block must fit one arena
    pub max_mip_tail_size: u64,
}

#[derive(Debug, Clone, Copy)]
struct TileRange {
    start_page: u32,
    num_pages: u32,
}

struct TextureState {
    descriptor: TextureDescriptor,
    image: Arc<dyn ImageSource>,
    info: TextureInfo,
    is_initialized: bool,
    tile_size: UVec2,
    mip_tail_first_level: u32,
    mip_tail_size: u64,
    mip_level_dims: Vec<UVec2>,
    sampler: TextureSampler,
    /// Tile pages reserved by this texture; kept across image replacement
    tile_range: Option<TileRange>,
    dense_storage: DevicePtr,
}

pub(crate) struct DemandTexture {
    id: u32,
    master: Option<Arc<DemandTexture>>,
    state: Mutex<TextureState>,
}

impl DemandTexture {
    pub fn new(id: u32, descriptor: TextureDescriptor, image: Arc<dyn ImageSource>) -> Self {
        Self {
            id,
            master: None,
            state: Mutex::new(TextureState {
                descriptor,
                image,
                info: TextureInfo::default(),
                is_initialized: false,
                tile_size: UVec2::ZERO,
                mip_tail_first_level: 0,
                mip_tail_size: 0,
                mip_level_dims: Vec::new(),
                sampler: TextureSampler::default(),
                tile_range: None,
                dense_storage: DevicePtr::NULL,
            }),
        }
    }

    /// Texture sharing the image and tile pages of `master`
    pub fn new_variant(id: u32, master: Arc<DemandTexture>, descriptor: TextureDescriptor) -> Self {
        let image = master.image();
        let mut texture = Self::new(id, descriptor, image);
        texture.master = Some(master);
        texture
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn master(&self) -> Option<&Arc<DemandTexture>> {
        self.master.as_ref()
    }

    pub fn image(&self) -> Arc<dyn ImageSource> {
        self.state.lock().image.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().image.is_open()
    }

    /// Open the image if needed and build the sampler.
    ///
    /// Sparse textures reserve their tile pages through `reserve_tile_pages`
    /// on first use; variants take the page range of their master instead.
    /// Returns the sampler, which is cached until the image is replaced.
    pub fn init(
        &self,
        config: TextureConfig,
        reserve_tile_pages: &mut dyn FnMut(u32) -> PagingResult<u32>,
    ) -> PagingResult<TextureSampler> {
        let master_sampler = match &self.master {
            Some(master) => Some(master.init(config, reserve_tile_pages)?),
            None => None,
        };

        let mut state = self.state.lock();
        if state.is_initialized {
            return Ok(state.sampler);
        }

        let info = if state.image.is_open() {
            state.image.info()
        } else {
            state.image.open()?
        };
        state.info = info;
        state.mip_level_dims = (0..info.num_mip_levels).map(|level| info.level_dims(level)).collect();

        let tile_size = sparse_tile_size(info.pixel_size());
        let tail_first_level = mip_tail_first_level(&info, tile_size);
        let tail_size: u64 = (tail_first_level..info.num_mip_levels)
            .map(|level| info.level_size_in_bytes(level))
            .sum();
        // a texture within one tile has nothing to page
        let fits_one_tile = info.width <= tile_size.x && info.height <= tile_size.y;
        let mut sparse = config.use_sparse_textures && info.is_tiled && !fits_one_tile;
        if sparse && tail_size > config.max_mip_tail_size {
            log::warn!(
                "texture {}: {}x{} mip tail of {tail_size} bytes exceeds an arena, using dense storage",
                self.id,
                info.width,
                info.height
            );
            sparse = false;
        }
        if sparse {
            state.tile_size = tile_size;
            state.mip_tail_first_level = tail_first_level;
            state.mip_tail_size = tail_size;
        } else {
            state.tile_size = DENSE_TILE_SIZE;
            state.mip_tail_first_level = 0;
            state.mip_tail_size = texture_size_in_bytes(&info);
        }

        let mut sampler = TextureSampler {
            width: info.width,
            height: info.height,
            mip_tail_first_level: state.mip_tail_first_level,
            ..Default::default()
        };
        sampler.desc.set_num_mip_levels(info.num_mip_levels);
        sampler.desc.set_tile_size(state.tile_size);
        sampler.desc.set_sparse(sparse);
        sampler.desc.set_address_mode(0, state.descriptor.address_mode[0]);
        sampler.desc.set_address_mode(1, state.descriptor.address_mode[1]);
        sampler.desc.set_mipmap_filter_linear(state.descriptor.mipmap_filter_linear);
        sampler.desc.set_max_anisotropy(state.descriptor.max_anisotropy);

        if sparse {
            sampler.desc.set_tile_layout(config.tile_layout);
            let (mip_level_sizes, num_pages) = build_mip_level_sizes(
                info.width,
                info.height,
                state.tile_size,
                info.num_mip_levels,
                state.mip_tail_first_level,
                config.tile_layout,
            );
            sampler.mip_level_sizes = mip_level_sizes;
            sampler.num_pages = num_pages;
            let reserved = state.tile_range;
            sampler.start_page = match master_sampler {
                Some(master) => master.start_page,
                None => match reserved {
                    Some(range) if range.num_pages >= num_pages => range.start_page,
                    _ => {
                        let start_page = reserve_tile_pages(num_pages)?;
                        state.tile_range = Some(TileRange { start_page, num_pages });
                        start_page
                    }
                },
            };
        } else {
            sampler.num_pages = 0;
            sampler.start_page = self.id;
        }
        sampler.desc.set_initialized(true);

        log::debug!(
            "texture {}: {}x{} {} levels, {} tiles {}x{}, mip tail from level {}, pages [{}, {})",
            self.id,
            info.width,
            info.height,
            info.num_mip_levels,
            if sparse { "sparse" } else { "dense" },
            state.tile_size.x,
            state.tile_size.y,
            state.mip_tail_first_level,
            sampler.start_page,
            sampler.start_page + sampler.num_pages
        );

        state.sampler = sampler;
        state.is_initialized = true;
        Ok(sampler)
    }

    /// Sampler built by [`Self::init`]
    pub fn sampler(&self) -> Option<TextureSampler> {
        let state = self.state.lock();
        state.is_initialized.then_some(state.sampler)
    }

    pub fn info(&self) -> TextureInfo {
        self.state.lock().info
    }

    /// Bytes of the mip tail; the whole texture for dense textures
    pub fn mip_tail_size(&self) -> u64 {
        self.state.lock().mip_tail_size
    }

    /// Tile page of a tile coordinate, or `None` before init and for dense textures
    pub fn tile_page_id(&self, mip_level: u32, tile_x: u32, tile_y: u32) -> Option<u32> {
        let sampler = self.sampler()?;
        if sampler.num_pages == 0 {
            return None;
        }
        if mip_level >= sampler.mip_tail_first_level {
            return Some(sampler.start_page);
        }
        Some(sampler.tile_page_id(mip_level, tile_x, tile_y))
    }

    /// Read one tile into `dest`
    pub fn read_tile(&self, coord: TileCoord, dest: &mut [u8]) -> PagingResult<()> {
        let (image, tile_size) = {
            let state = self.state.lock();
            (state.image.clone(), state.tile_size)
        };
        let tile = Tile {
            x: coord.x,
            y: coord.y,
            width: tile_size.x,
            height: tile_size.y,
        };
        image.read_tile(dest, coord.mip_level, tile)?;
        Ok(())
    }

    /// Read the mip tail levels packed back to back
    pub fn read_mip_tail(&self, dest: &mut [u8]) -> PagingResult<()> {
        let state = self.state.lock();
        state.image.read_mip_tail(
            dest,
            state.mip_tail_first_level,
            state.info.num_mip_levels,
            &state.mip_level_dims,
            state.info.pixel_size(),
        )?;
        Ok(())
    }

    /// Read every mip level packed back to back
    pub fn read_all_levels(&self, dest: &mut [u8]) -> PagingResult<()> {
        let state = self.state.lock();
        texpage_image::read_mip_levels(
            state.image.as_ref(),
            dest,
            0,
            state.info.num_mip_levels,
            &state.mip_level_dims,
            state.info.pixel_size(),
        )?;
        Ok(())
    }

    /// Base color packed as unorm16 RGBA.
    ///
    /// Images without a stored base color fall back to their 1x1 mip level
    /// when it is 8-bit.
    pub fn read_base_color(&self) -> PagingResult<u64> {
        let image = self.image();
        if !image.is_open() {
            image.open()?;
        }
        if let Some(color) = image.read_base_color()? {
            return Ok(pack_base_color(color));
        }

        let info = image.info();
        let last_level = info.num_mip_levels.saturating_sub(1);
        let dims = info.level_dims(last_level);
        let bytes_per_channel = info.format.bytes_per_channel();
        if info.num_mip_levels == 0 || dims != UVec2::ONE || bytes_per_channel != 1 {
            return Ok(NO_BASE_COLOR);
        }

        let mut pixel = vec![0u8; info.pixel_size() as usize];
        image.read_mip_level(&mut pixel, last_level, 1, 1)?;
        let mut color = [0.0, 0.0, 0.0, 1.0];
        for (channel, value) in pixel.iter().take(4).enumerate() {
            color[channel] = *value as f32 / 255.0;
        }
        if info.num_channels == 1 {
            color[1] = color[0];
            color[2] = color[0];
        }
        Ok(pack_base_color(color))
    }

    /// Swap in a new image. Returns true when the sampler no longer matches
    /// and has to be rebuilt.
    pub fn set_image(&self, descriptor: TextureDescriptor, image: Arc<dyn ImageSource>) -> PagingResult<bool> {
        let mut state = self.state.lock();

        if !state.image.is_open() {
            state.descriptor = descriptor;
            state.image = image;
            return Ok(false);
        }

        let new_info = image.open()?;
        if descriptor == state.descriptor && new_info == state.info {
            state.image = image;
            return Ok(false);
        }

        state.info = new_info;
        state.descriptor = descriptor;
        state.image = image;
        state.sampler = TextureSampler::default();
        state.is_initialized = false;
        Ok(true)
    }

    /// Dense storage of this texture, or of its master for variants
    pub fn dense_storage(&self) -> DevicePtr {
        match &self.master {
            Some(master) => master.dense_storage(),
            None => self.state.lock().dense_storage,
        }
    }

    /// Keep `ptr` as dense storage unless another fill got there first.
    /// Returns the storage in use.
    pub fn install_dense_storage(&self, ptr: DevicePtr) -> DevicePtr {
        let mut state = self.state.lock();
        if state.dense_storage.is_null() {
            state.dense_storage = ptr;
        }
        state.dense_storage
    }

    /// Detach the dense storage, leaving none
    pub fn take_dense_storage(&self) -> DevicePtr {
        std::mem::take(&mut self.state.lock().dense_storage)
    }

    /// Add this texture's image counters unless another texture already
    /// reported the same image
    pub fn accumulate_statistics(&self, stats: &mut Statistics, seen: &mut Vec<*const ()>) {
        let image = self.image();
        let key = Arc::as_ptr(&image) as *const ();
        if seen.contains(&key) {
            return;
        }
        seen.push(key);

        stats.num_tiles_read += image.num_tiles_read();
        stats.num_bytes_read += image.num_bytes_read();
        stats.read_time += image.total_read_time();
        let info = image.info();
        if info.is_valid {
            stats.virtual_texture_bytes += texture_size_in_bytes(&info);
        }
    }
}
