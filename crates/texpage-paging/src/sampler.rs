//! Texture Sampler
//!
//! Device-visible description of a demand-loaded texture. The layout is read
//! by device-side sampling code, so field order and sizes are fixed.

use bytemuck::{Pod, Zeroable};
use glam::UVec2;

use crate::tile_indexing::{AddressMode, TileCoord, TileLayout, level_dim_in_tiles};

/// Number of mip levels with per-level page ranges
pub const MAX_TILE_LEVELS: usize = 9;

/// Pages reserved per texture id: the sampler page and the base color page
pub const PAGES_PER_TEXTURE: u32 = 2;

/// Offset of the base color page from the texture id
pub const BASE_COLOR_OFFSET: u32 = 1;

/// Texture id owning a sampler or base color page
#[inline]
pub fn page_id_to_sampler_id(page_id: u32) -> u32 {
    page_id - (page_id % PAGES_PER_TEXTURE)
}

#[inline]
pub fn is_base_color_id(page_id: u32) -> bool {
    page_id - page_id_to_sampler_id(page_id) == BASE_COLOR_OFFSET
}

/// Page range of one mip level
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MipLevelSizes {
    /// First page of the level, relative to the sampler's start page
    pub mip_level_start: u32,
    pub level_width_in_tiles: u16,
    pub level_height_in_tiles: u16,
}

/// Packed sampler description bits.
///
/// | bits  | field                |
/// |-------|----------------------|
/// | 0     | initialized          |
/// | 3..8  | mip level count      |
/// | 8..12 | log2 tile width      |
/// | 12..16| log2 tile height     |
/// | 16    | linear tile layout   |
/// | 20    | sparse texture       |
/// | 22..24| address mode u       |
/// | 24..26| address mode v       |
/// | 26    | mipmap filter linear |
/// | 27..32| max anisotropy       |
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct SamplerDescription(pub u32);

impl SamplerDescription {
    #[inline]
    fn field(self, shift: u32, width: u32) -> u32 {
        (self.0 >> shift) & ((1 << width) - 1)
    }

    #[inline]
    fn set_field(&mut self, shift: u32, width: u32, value: u32) {
        let mask = ((1u32 << width) - 1) << shift;
        self.0 = (self.0 & !mask) | ((value << shift) & mask);
    }

    pub fn is_initialized(self) -> bool {
        self.field(0, 1) != 0
    }

    pub fn set_initialized(&mut self, value: bool) {
        self.set_field(0, 1, value as u32);
    }

    pub fn num_mip_levels(self) -> u32 {
        self.field(3, 5)
    }

    pub fn set_num_mip_levels(&mut self, value: u32) {
        self.set_field(3, 5, value);
    }

    pub fn log_tile_width(self) -> u32 {
        self.field(8, 4)
    }

    pub fn log_tile_height(self) -> u32 {
        self.field(12, 4)
    }

    pub fn set_tile_size(&mut self, tile: UVec2) {
        self.set_field(8, 4, tile.x.max(1).ilog2());
        self.set_field(12, 4, tile.y.max(1).ilog2());
    }

    pub fn tile_layout(self) -> TileLayout {
        if self.field(16, 1) != 0 {
            TileLayout::Linear
        } else {
            TileLayout::Footprint
        }
    }

    pub fn set_tile_layout(&mut self, layout: TileLayout) {
        self.set_field(16, 1, (layout == TileLayout::Linear) as u32);
    }

    pub fn is_sparse(self) -> bool {
        self.field(20, 1) != 0
    }

    pub fn set_sparse(&mut self, value: bool) {
        self.set_field(20, 1, value as u32);
    }

    pub fn address_mode(self, dim: usize) -> AddressMode {
        AddressMode::from_bits(self.field(22 + 2 * dim as u32, 2))
    }

    pub fn set_address_mode(&mut self, dim: usize, mode: AddressMode) {
        self.set_field(22 + 2 * dim as u32, 2, mode as u32);
    }

    pub fn mipmap_filter_linear(self) -> bool {
        self.field(26, 1) != 0
    }

    pub fn set_mipmap_filter_linear(&mut self, value: bool) {
        self.set_field(26, 1, value as u32);
    }

    pub fn max_anisotropy(self) -> u32 {
        self.field(27, 5)
    }

    pub fn set_max_anisotropy(&mut self, value: u32) {
        self.set_field(27, 5, value.min(31));
    }
}

/// Sampler read by device code for one texture
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureSampler {
    /// Dense texture storage; zero for sparse textures, whose tiles live in arenas
    pub texture: u64,
    pub desc: SamplerDescription,

    pub width: u32,
    pub height: u32,
    pub mip_tail_first_level: u32,

    /// First tile page of the texture
    pub start_page: u32,
    /// Tile pages reserved for the texture, zero for dense textures
    pub num_pages: u32,

    pub mip_level_sizes: [MipLevelSizes; MAX_TILE_LEVELS],
}

impl TextureSampler {
    /// Tile size in pixels
    pub fn tile_size(&self) -> UVec2 {
        UVec2::new(1 << self.desc.log_tile_width(), 1 << self.desc.log_tile_height())
    }

    /// Mip level and tile of a page index relative to `start_page`
    pub fn unpack_tile_index(&self, tile_index: u32) -> TileCoord {
        self.desc.tile_layout().unpack_tile_index(self, tile_index)
    }

    /// Page id of a tile
    pub fn tile_page_id(&self, mip_level: u32, tile_x: u32, tile_y: u32) -> u32 {
        let level = self.mip_level_sizes[(mip_level as usize).min(MAX_TILE_LEVELS - 1)];
        self.start_page
            + level.mip_level_start
            + self.desc.tile_layout().page_offset_from_tile_coords(
                tile_x,
                tile_y,
                level.level_width_in_tiles as u32,
            )
    }

    /// Whether the texture has levels packed into a mip tail page
    pub fn has_mip_tail(&self) -> bool {
        self.mip_tail_first_level < self.desc.num_mip_levels()
    }
}

/// Lay out the tile pages of a sparse texture, mip tail first.
///
/// Returns the per-level sizes and the total page count. Levels above
/// `mip_tail_first_level` are packed into the tail and get no pages of their own.
pub fn build_mip_level_sizes(
    width: u32,
    height: u32,
    tile: UVec2,
    num_mip_levels: u32,
    mip_tail_first_level: u32,
    layout: TileLayout,
) -> ([MipLevelSizes; MAX_TILE_LEVELS], u32) {
    let tail = mip_tail_first_level.min(MAX_TILE_LEVELS as u32 - 1);
    let num_tiles = |mip_level: u32| -> u32 {
        if mip_level > tail || mip_level >= num_mip_levels {
            return 0;
        }
        layout.num_tiles_in_level(
            level_dim_in_tiles(width, mip_level, tile.x),
            level_dim_in_tiles(height, mip_level, tile.y),
        )
    };

    let mut mls = [MipLevelSizes::default(); MAX_TILE_LEVELS];
    for mip_level in (0..=tail).rev() {
        let index = mip_level as usize;
        mls[index].mip_level_start = if mip_level < tail {
            mls[index + 1].mip_level_start + num_tiles(mip_level + 1)
        } else {
            0
        };
        mls[index].level_width_in_tiles = level_dim_in_tiles(width, mip_level, tile.x) as u16;
        mls[index].level_height_in_tiles = level_dim_in_tiles(height, mip_level, tile.y) as u16;
    }
    let num_pages = mls[0].mip_level_start + num_tiles(0);
    (mls, num_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_layout() {
        assert_eq!(std::mem::size_of::<MipLevelSizes>(), 8);
        assert_eq!(std::mem::size_of::<TextureSampler>(), 104);
        assert_eq!(std::mem::align_of::<TextureSampler>(), 8);
        assert_eq!(std::mem::offset_of!(TextureSampler, start_page), 24);
        assert_eq!(std::mem::offset_of!(TextureSampler, mip_level_sizes), 32);
    }

    #[test]
    fn test_description_fields() {
        let mut desc = SamplerDescription::default();
        desc.set_initialized(true);
        desc.set_num_mip_levels(11);
        desc.set_tile_size(UVec2::new(128, 64));
        desc.set_sparse(true);
        desc.set_address_mode(0, AddressMode::Clamp);
        desc.set_address_mode(1, AddressMode::Border);
        desc.set_max_anisotropy(16);

        assert!(desc.is_initialized());
        assert_eq!(desc.num_mip_levels(), 11);
        assert_eq!(desc.log_tile_width(), 7);
        assert_eq!(desc.log_tile_height(), 6);
        assert!(desc.is_sparse());
        assert_eq!(desc.address_mode(0), AddressMode::Clamp);
        assert_eq!(desc.address_mode(1), AddressMode::Border);
        assert_eq!(desc.max_anisotropy(), 16);
        assert_eq!(desc.tile_layout(), TileLayout::Footprint);
        assert!(!desc.mipmap_filter_linear());

        desc.set_tile_layout(TileLayout::Linear);
        desc.set_num_mip_levels(3);
        assert_eq!(desc.tile_layout(), TileLayout::Linear);
        assert_eq!(desc.num_mip_levels(), 3);
        assert_eq!(desc.log_tile_width(), 7);
    }

    #[test]
    fn test_texture_ids() {
        assert_eq!(page_id_to_sampler_id(6), 6);
        assert_eq!(page_id_to_sampler_id(7), 6);
        assert!(is_base_color_id(7));
        assert!(!is_base_color_id(6));
    }

    #[test]
    fn test_single_level_without_tail() {
        // 512x512 with 128x128 tiles and one level: no tail, level 0 starts at page 0
        let (mls, num_pages) =
            build_mip_level_sizes(512, 512, UVec2::splat(128), 1, 1, TileLayout::Linear);
        assert_eq!(mls[0].mip_level_start, 0);
        assert_eq!(num_pages, 16);
    }

    #[test]
    fn test_tile_page_id() {
        let (mip_level_sizes, num_pages) =
            build_mip_level_sizes(1024, 1024, UVec2::splat(128), 11, 4, TileLayout::Footprint);
        let mut sampler = TextureSampler {
            width: 1024,
            height: 1024,
            mip_tail_first_level: 4,
            start_page: 5000,
            num_pages,
            mip_level_sizes,
            ..Default::default()
        };
        sampler.desc.set_num_mip_levels(11);
        sampler.desc.set_tile_size(UVec2::splat(128));

        assert!(sampler.has_mip_tail());
        assert_eq!(sampler.tile_page_id(4, 0, 0), 5000);
        let page = sampler.tile_page_id(0, 3, 5);
        let coord = sampler.unpack_tile_index(page - sampler.start_page);
        assert_eq!(coord, TileCoord { mip_level: 0, x: 3, y: 5 });
        assert_eq!(sampler.tile_size(), UVec2::splat(128));
    }
}
