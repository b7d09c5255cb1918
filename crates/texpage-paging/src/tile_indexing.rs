//! Tile Indexing
//!
//! Pure arithmetic mapping page ids to texture tiles. The same functions are
//! used by host code and by the device-side kernels, so they carry no state
//! and stay branch-light.
//!
//! Two layouts exist for the tiles of a mip level:
//! - [`TileLayout::Footprint`]: tiles grouped into 8x8 blocks, blocks scanned
//!   row-major across the level and tiles row-major inside a block. This is
//!   the order in which the texture footprint instruction reports tiles.
//! - [`TileLayout::Linear`]: plain row-major order, see [`linear`].
//!
//! The layouts are incompatible; a sampler records which one its page ids use.

use glam::UVec2;
use serde::{Deserialize, Serialize};

use crate::sampler::{MAX_TILE_LEVELS, TextureSampler};

/// Largest f32 below 1.0
const FIRST_FLOAT_LESS_THAN_ONE: f32 = 0.999_999_94;

/// Texture address mode, numbered like the hardware address modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum AddressMode {
    #[default]
    Wrap = 0,
    Clamp = 1,
    Mirror = 2,
    Border = 3,
}

impl AddressMode {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Wrap,
            1 => Self::Clamp,
            2 => Self::Mirror,
            _ => Self::Border,
        }
    }
}

/// Order of tile pages within a mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TileLayout {
    /// 8x8 block interleaved, matching the footprint instruction
    #[default]
    Footprint,
    /// Row-major
    Linear,
}

impl TileLayout {
    #[inline]
    pub fn num_tiles_in_level(self, level_width_in_tiles: u32, level_height_in_tiles: u32) -> u32 {
        match self {
            Self::Footprint => num_tiles_in_level(level_width_in_tiles, level_height_in_tiles),
            Self::Linear => linear::num_tiles_in_level(level_width_in_tiles, level_height_in_tiles),
        }
    }

    #[inline]
    pub fn tile_coords_from_page_offset(self, page_offset: u32, level_width_in_tiles: u32) -> UVec2 {
        match self {
            Self::Footprint => tile_coords_from_page_offset(page_offset, level_width_in_tiles),
            Self::Linear => linear::tile_coords_from_page_offset(page_offset, level_width_in_tiles),
        }
    }

    #[inline]
    pub fn page_offset_from_tile_coords(self, x: u32, y: u32, level_width_in_tiles: u32) -> u32 {
        match self {
            Self::Footprint => page_offset_from_tile_coords(x, y, level_width_in_tiles),
            Self::Linear => linear::page_offset_from_tile_coords(x, y, level_width_in_tiles),
        }
    }

    #[inline]
    pub fn unpack_tile_index(self, sampler: &TextureSampler, tile_index: u32) -> TileCoord {
        match self {
            Self::Footprint => unpack_tile_index(sampler, tile_index),
            Self::Linear => linear::unpack_tile_index(sampler, tile_index),
        }
    }
}

/// Mip level and tile coordinates of a tile page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileCoord {
    pub mip_level: u32,
    pub x: u32,
    pub y: u32,
}

/// Dimension of a mip level, never below one pixel
#[inline]
pub fn calculate_level_dim(mip_level: u32, texture_dim: u32) -> u32 {
    texture_dim.checked_shr(mip_level).unwrap_or(0).max(1)
}

#[inline]
pub fn level_dim_in_tiles(texture_dim: u32, mip_level: u32, tile_dim: u32) -> u32 {
    calculate_level_dim(mip_level, texture_dim).div_ceil(tile_dim)
}

/// Page count of a level. Both dimensions are padded to multiples of 8 so the
/// 8x8 block arithmetic stays contiguous; padding tiles are never sampled.
#[inline]
pub fn num_tiles_in_level(level_width_in_tiles: u32, level_height_in_tiles: u32) -> u32 {
    let width = (level_width_in_tiles + 7) & !7;
    let height = (level_height_in_tiles + 7) & !7;
    width * height
}

#[inline]
pub fn tile_coords_from_page_offset(page_offset: u32, level_width_in_tiles: u32) -> UVec2 {
    let level_width_in_blocks = level_width_in_tiles.div_ceil(8).max(1);

    let block_num = page_offset / 64;
    let block = UVec2::new(block_num % level_width_in_blocks, block_num / level_width_in_blocks);

    let block_offset = page_offset % 64;
    block * 8 + UVec2::new(block_offset % 8, block_offset / 8)
}

#[inline]
pub fn page_offset_from_tile_coords(x: u32, y: u32, level_width_in_tiles: u32) -> u32 {
    let level_width_in_blocks = level_width_in_tiles.div_ceil(8);
    64 * (level_width_in_blocks * (y / 8)) // full rows of blocks
        + 64 * (x / 8) // full blocks on the last row
        + 8 * (y % 8)
        + (x % 8)
}

#[inline]
fn unpack_with(sampler: &TextureSampler, tile_index: u32, coords: impl Fn(u32, u32) -> UVec2) -> TileCoord {
    let mls = &sampler.mip_level_sizes;
    let first = sampler.mip_tail_first_level.min(MAX_TILE_LEVELS as u32 - 1) as usize;
    for mip_level in (0..=first).rev() {
        let next_mip_level_start = if mip_level > 0 {
            mls[mip_level - 1].mip_level_start
        } else {
            sampler.num_pages
        };
        if tile_index < next_mip_level_start {
            let level = mls[mip_level];
            let tile = coords(
                tile_index - level.mip_level_start,
                level.level_width_in_tiles as u32,
            );
            return TileCoord {
                mip_level: mip_level as u32,
                x: tile.x,
                y: tile.y,
            };
        }
    }
    TileCoord::default()
}

/// Find the mip level and tile owning `tile_index` (relative to the sampler's
/// start page). Levels are scanned from the mip tail toward level 0.
#[inline]
pub fn unpack_tile_index(sampler: &TextureSampler, tile_index: u32) -> TileCoord {
    unpack_with(sampler, tile_index, tile_coords_from_page_offset)
}

/// The first page of every sparse texture holds its mip tail
#[inline]
pub fn is_mip_tail_index(page_index: u32) -> bool {
    page_index == 0
}

/// Wrap a normalized texture coordinate and keep it strictly below 1.0
#[inline]
pub fn wrap_tex_coord(x: f32, address_mode: AddressMode) -> f32 {
    let x = if address_mode == AddressMode::Wrap {
        x - x.floor()
    } else {
        x
    };
    x.clamp(0.0, FIRST_FLOAT_LESS_THAN_ONE)
}

/// Wrap a tile coordinate reported by the footprint instruction, which
/// addresses tiles toroidally within an 8x8 block anchored at `tile_x`.
#[inline]
pub fn wrap_footprint_tile_coord(x: i32, dx: u32, tile_x: u32, level_width_in_tiles: u32) -> i32 {
    let width = level_width_in_tiles as i32;
    let mut x = x;
    // unsigned sum: a negative x rotates unless dx brings it back into the block
    if (x as u32).wrapping_add(dx) >= 8 {
        x -= 8;
    }
    // small levels sometimes spill over
    if x > width {
        x = 0;
    }
    x += 8 * tile_x as i32;

    if x < 0 {
        x += width;
    }
    if x >= width {
        x -= width;
    }
    x
}

/// Row-major tile layout, for configurations that do not decode footprints
pub mod linear {
    use super::*;

    #[inline]
    pub fn num_tiles_in_level(level_width_in_tiles: u32, level_height_in_tiles: u32) -> u32 {
        level_width_in_tiles * level_height_in_tiles
    }

    #[inline]
    pub fn tile_coords_from_page_offset(page_offset: u32, level_width_in_tiles: u32) -> UVec2 {
        let width = level_width_in_tiles.max(1);
        UVec2::new(page_offset % width, page_offset / width)
    }

    #[inline]
    pub fn page_offset_from_tile_coords(x: u32, y: u32, level_width_in_tiles: u32) -> u32 {
        y * level_width_in_tiles + x
    }

    #[inline]
    pub fn unpack_tile_index(sampler: &TextureSampler, tile_index: u32) -> TileCoord {
        unpack_with(sampler, tile_index, tile_coords_from_page_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::build_mip_level_sizes;

    #[test]
    fn test_level_dims() {
        assert_eq!(calculate_level_dim(0, 1920), 1920);
        assert_eq!(calculate_level_dim(3, 1920), 240);
        assert_eq!(calculate_level_dim(12, 1920), 1);
        assert_eq!(calculate_level_dim(40, 1920), 1);

        assert_eq!(level_dim_in_tiles(1920, 0, 128), 15);
        assert_eq!(level_dim_in_tiles(1080, 0, 128), 9);
        assert_eq!(level_dim_in_tiles(1080, 4, 128), 1);
    }

    #[test]
    fn test_num_tiles_pads_to_blocks() {
        assert_eq!(num_tiles_in_level(1, 1), 64);
        assert_eq!(num_tiles_in_level(8, 8), 64);
        assert_eq!(num_tiles_in_level(9, 3), 16 * 8);
        assert_eq!(linear::num_tiles_in_level(9, 3), 27);
    }

    #[test]
    fn test_footprint_offsets() {
        // Width 20 tiles is 3 blocks wide
        assert_eq!(page_offset_from_tile_coords(0, 0, 20), 0);
        assert_eq!(page_offset_from_tile_coords(7, 0, 20), 7);
        assert_eq!(page_offset_from_tile_coords(0, 1, 20), 8);
        assert_eq!(page_offset_from_tile_coords(8, 0, 20), 64);
        assert_eq!(page_offset_from_tile_coords(0, 8, 20), 3 * 64);
        assert_eq!(page_offset_from_tile_coords(17, 9, 20), 3 * 64 + 2 * 64 + 8 + 1);
    }

    #[test]
    fn test_footprint_round_trip() {
        for width in 1..=33 {
            for y in 0..20 {
                for x in 0..width {
                    let offset = page_offset_from_tile_coords(x, y, width);
                    assert_eq!(
                        tile_coords_from_page_offset(offset, width),
                        UVec2::new(x, y),
                        "width {width}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_linear_round_trip() {
        for width in 1..=33 {
            for y in 0..20 {
                for x in 0..width {
                    let offset = linear::page_offset_from_tile_coords(x, y, width);
                    assert_eq!(linear::tile_coords_from_page_offset(offset, width), UVec2::new(x, y));
                }
            }
        }
    }

    fn sampler(width: u32, height: u32, tile: u32, levels: u32, tail: u32, layout: TileLayout) -> TextureSampler {
        let (mip_level_sizes, num_pages) =
            build_mip_level_sizes(width, height, UVec2::splat(tile), levels, tail, layout);
        let mut sampler = TextureSampler {
            width,
            height,
            mip_tail_first_level: tail,
            num_pages,
            mip_level_sizes,
            ..Default::default()
        };
        sampler.desc.set_num_mip_levels(levels);
        sampler.desc.set_tile_layout(layout);
        sampler
    }

    fn check_unpack(sampler: &TextureSampler, layout: TileLayout) {
        let mls = &sampler.mip_level_sizes;
        for mip in 0..=sampler.mip_tail_first_level {
            let level = mls[mip as usize];
            let dims = UVec2::new(
                level_dim_in_tiles(sampler.width, mip, 64),
                level_dim_in_tiles(sampler.height, mip, 64),
            );
            assert_eq!(level.level_width_in_tiles as u32, dims.x);
            for y in 0..dims.y {
                for x in 0..dims.x {
                    let index = level.mip_level_start
                        + layout.page_offset_from_tile_coords(x, y, dims.x);
                    let coord = layout.unpack_tile_index(sampler, index);
                    assert_eq!(coord, TileCoord { mip_level: mip, x, y });
                    assert_eq!(coord, sampler.unpack_tile_index(index));
                }
            }
        }
    }

    #[test]
    fn test_unpack_inverts_level_assignment() {
        // 1000x600, 64x64 tiles: levels 0..4 tiled, level 4 (62x37) starts the tail
        let footprint = sampler(1000, 600, 64, 10, 4, TileLayout::Footprint);
        assert_eq!(footprint.mip_level_sizes[4].mip_level_start, 0);
        assert_eq!(footprint.mip_level_sizes[3].mip_level_start, 64);
        check_unpack(&footprint, TileLayout::Footprint);

        let linear = sampler(1000, 600, 64, 10, 4, TileLayout::Linear);
        assert_eq!(linear.mip_level_sizes[3].mip_level_start, 1);
        check_unpack(&linear, TileLayout::Linear);
    }

    #[test]
    fn test_unpack_out_of_range_falls_back() {
        let sampler = sampler(256, 256, 64, 9, 3, TileLayout::Footprint);
        assert_eq!(
            unpack_tile_index(&sampler, sampler.num_pages + 5),
            TileCoord::default()
        );
        assert_eq!(unpack_tile_index(&sampler, 0), TileCoord { mip_level: 3, x: 0, y: 0 });
    }

    #[test]
    fn test_mip_tail_index() {
        assert!(is_mip_tail_index(0));
        assert!((1..1000).all(|page| !is_mip_tail_index(page)));
    }

    #[test]
    fn test_wrap_tex_coord() {
        assert_eq!(wrap_tex_coord(1.25, AddressMode::Wrap), 0.25);
        assert_eq!(wrap_tex_coord(-0.25, AddressMode::Wrap), 0.75);
        assert_eq!(wrap_tex_coord(1.0, AddressMode::Wrap), 0.0);
        assert_eq!(wrap_tex_coord(1.0, AddressMode::Clamp), FIRST_FLOAT_LESS_THAN_ONE);
        assert_eq!(wrap_tex_coord(-3.0, AddressMode::Clamp), 0.0);
        assert!(wrap_tex_coord(0.999_999_99, AddressMode::Wrap) < 1.0);
    }

    #[test]
    fn test_wrap_footprint_tile_coord() {
        // No rotation inside the block
        assert_eq!(wrap_footprint_tile_coord(3, 2, 1, 20), 11);
        // Rotated past the block edge
        assert_eq!(wrap_footprint_tile_coord(7, 2, 1, 20), 7);
        // Wraps around the level
        assert_eq!(wrap_footprint_tile_coord(5, 0, 2, 20), 1);
        assert_eq!(wrap_footprint_tile_coord(6, 4, 0, 20), 18);
        // Spill on a tiny level
        assert_eq!(wrap_footprint_tile_coord(5, 0, 0, 2), 0);
        // Negative coords rotate a whole block back
        assert_eq!(wrap_footprint_tile_coord(-1, 0, 2, 20), 7);
        assert_eq!(wrap_footprint_tile_coord(-3, 0, 0, 20), 9);
        // unless the offset returns them into the block
        assert_eq!(wrap_footprint_tile_coord(-1, 1, 1, 20), 7);
    }

    #[test]
    fn test_address_mode_bits() {
        for mode in [AddressMode::Wrap, AddressMode::Clamp, AddressMode::Mirror, AddressMode::Border] {
            assert_eq!(AddressMode::from_bits(mode as u32), mode);
        }
    }
}
