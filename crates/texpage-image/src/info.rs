use glam::UVec2;
use serde::{Deserialize, Serialize};

/// Channel format of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    U8,
    U16,
    U32,
    F16,
    F32,
}

impl PixelFormat {
    pub fn bytes_per_channel(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::F16 => 2,
            Self::U32 | Self::F32 => 4,
        }
    }
}

/// Image description returned by [`crate::ImageSource::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub num_channels: u32,
    pub num_mip_levels: u32,
    /// False until the image has been opened
    pub is_valid: bool,
    /// True when the source can read individual tiles
    pub is_tiled: bool,
}

impl TextureInfo {
    /// Bytes per pixel
    pub fn pixel_size(&self) -> u32 {
        self.format.bytes_per_channel() * self.num_channels
    }

    /// Dimensions of a mip level
    pub fn level_dims(&self, mip_level: u32) -> UVec2 {
        UVec2::new(
            (self.width >> mip_level).max(1),
            (self.height >> mip_level).max(1),
        )
    }

    /// Size in bytes of one mip level
    pub fn level_size_in_bytes(&self, mip_level: u32) -> u64 {
        let dims = self.level_dims(mip_level);
        dims.x as u64 * dims.y as u64 * self.pixel_size() as u64
    }
}

/// Size in bytes of every mip level of a texture
pub fn texture_size_in_bytes(info: &TextureInfo) -> u64 {
    (0..info.num_mip_levels)
        .map(|level| info.level_size_in_bytes(level))
        .sum()
}

/// Tile request: `x`, `y` are tile coordinates, `width`, `height` the tile size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Tile {
    /// Pixel origin of the tile within its mip level
    pub fn origin(&self) -> UVec2 {
        UVec2::new(self.x * self.width, self.y * self.height)
    }

    pub fn size_in_bytes(&self, pixel_size: u32) -> usize {
        self.width as usize * self.height as usize * pixel_size as usize
    }
}
