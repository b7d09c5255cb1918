use std::time::Duration;

use glam::{UVec2, Vec4};
use parking_lot::RwLock;

use crate::{ImageError, ImageResult, ImageSource, PixelFormat, ReadCounters, TextureInfo, Tile};

/// Per-level colors so that resident mip levels are easy to tell apart
const LEVEL_COLORS: [Vec4; 8] = [
    Vec4::new(1.0, 0.0, 0.0, 1.0),
    Vec4::new(1.0, 0.5, 0.0, 1.0),
    Vec4::new(1.0, 1.0, 0.0, 1.0),
    Vec4::new(0.0, 1.0, 0.0, 1.0),
    Vec4::new(0.0, 1.0, 1.0, 1.0),
    Vec4::new(0.0, 0.0, 1.0, 1.0),
    Vec4::new(0.5, 0.0, 1.0, 1.0),
    Vec4::new(1.0, 0.0, 1.0, 1.0),
];

const BACKGROUND: Vec4 = Vec4::new(1.0, 1.0, 1.0, 1.0);

/// Procedural RGBA8 checkerboard that can be read tile by tile.
///
/// Odd squares are white, even squares take the color of the mip level.
#[derive(Debug)]
pub struct CheckerBoardImage {
    width: u32,
    height: u32,
    squares_per_side: u32,
    use_mipmaps: bool,
    info: RwLock<TextureInfo>,
    counters: ReadCounters,
}

impl CheckerBoardImage {
    pub fn new(width: u32, height: u32, squares_per_side: u32, use_mipmaps: bool) -> Self {
        Self {
            width,
            height,
            squares_per_side: squares_per_side.max(1),
            use_mipmaps,
            info: RwLock::new(TextureInfo::default()),
            counters: ReadCounters::new(),
        }
    }

    fn num_mip_levels(&self) -> u32 {
        if self.use_mipmaps {
            32 - self.width.max(self.height).max(1).leading_zeros()
        } else {
            1
        }
    }

    /// Color of a pixel, `x` and `y` in level coordinates
    pub fn pixel(&self, mip_level: u32, x: u32, y: u32) -> [u8; 4] {
        let dims = UVec2::new(
            (self.width >> mip_level).max(1),
            (self.height >> mip_level).max(1),
        );
        let square = (dims / self.squares_per_side).max(UVec2::ONE);
        let odd = ((x / square.x) + (y / square.y)) % 2 == 1;
        let color = if odd {
            BACKGROUND
        } else {
            LEVEL_COLORS[mip_level as usize % LEVEL_COLORS.len()]
        };
        let rgba = (color * 255.0).round();
        [rgba.x as u8, rgba.y as u8, rgba.z as u8, rgba.w as u8]
    }

    fn fill(&self, dest: &mut [u8], mip_level: u32, origin: UVec2, size: UVec2, stride: u32) {
        for y in 0..size.y {
            let row = (y * stride) as usize * 4;
            for x in 0..size.x {
                let start = row + x as usize * 4;
                dest[start..start + 4].copy_from_slice(&self.pixel(mip_level, origin.x + x, origin.y + y));
            }
        }
    }

    fn open_info(&self) -> ImageResult<TextureInfo> {
        let info = *self.info.read();
        if info.is_valid { Ok(info) } else { Err(ImageError::NotOpen) }
    }
}

impl ImageSource for CheckerBoardImage {
    fn open(&self) -> ImageResult<TextureInfo> {
        let info = TextureInfo {
            width: self.width,
            height: self.height,
            format: PixelFormat::U8,
            num_channels: 4,
            num_mip_levels: self.num_mip_levels(),
            is_valid: true,
            is_tiled: true,
        };
        *self.info.write() = info;
        Ok(info)
    }

    fn close(&self) {
        *self.info.write() = TextureInfo::default();
    }

    fn is_open(&self) -> bool {
        self.info.read().is_valid
    }

    fn info(&self) -> TextureInfo {
        *self.info.read()
    }

    fn read_tile(&self, dest: &mut [u8], mip_level: u32, tile: Tile) -> ImageResult<()> {
        let info = self.open_info()?;
        if mip_level >= info.num_mip_levels {
            return Err(ImageError::InvalidMipLevel {
                mip_level,
                num_mip_levels: info.num_mip_levels,
            });
        }
        let needed = tile.size_in_bytes(4);
        if dest.len() < needed {
            return Err(ImageError::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }

        let dims = info.level_dims(mip_level);
        let origin = tile.origin();
        if origin.x >= dims.x || origin.y >= dims.y {
            return Err(ImageError::InvalidTile {
                mip_level,
                x: tile.x,
                y: tile.y,
                width: tile.width,
                height: tile.height,
            });
        }

        let size = UVec2::new(tile.width, tile.height).min(dims - origin);
        self.counters.record(1, needed as u64, || {
            self.fill(dest, mip_level, origin, size, tile.width);
            Ok(())
        })
    }

    fn read_mip_level(&self, dest: &mut [u8], mip_level: u32, width: u32, height: u32) -> ImageResult<()> {
        let info = self.open_info()?;
        if mip_level >= info.num_mip_levels {
            return Err(ImageError::InvalidMipLevel {
                mip_level,
                num_mip_levels: info.num_mip_levels,
            });
        }
        let needed = width as usize * height as usize * 4;
        if dest.len() < needed {
            return Err(ImageError::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }
        self.fill(dest, mip_level, UVec2::ZERO, UVec2::new(width, height), width);
        Ok(())
    }

    fn read_base_color(&self) -> ImageResult<Option<[f32; 4]>> {
        Ok(Some(((LEVEL_COLORS[0] + BACKGROUND) * 0.5).to_array()))
    }

    fn num_tiles_read(&self) -> u64 {
        self.counters.tiles()
    }

    fn num_bytes_read(&self) -> u64 {
        self.counters.bytes()
    }

    fn total_read_time(&self) -> Duration {
        self.counters.time()
    }
}
