use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use glam::UVec2;

use crate::{ImageError, ImageResult, TextureInfo, Tile};

/// Supplier of raw pixel data for demand-loaded textures.
///
/// Reads may be issued concurrently from several worker threads, at most one
/// outstanding read per tile. Pixel data is tightly packed rows of
/// `pixel_size` bytes; a tile is written with a row stride of
/// `tile.width * pixel_size` bytes even when it is clipped by the level edge.
pub trait ImageSource: Send + Sync {
    /// Open the image and return its description. Opening twice is allowed.
    fn open(&self) -> ImageResult<TextureInfo>;

    /// Release resources held by the image
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Image description; invalid until opened
    fn info(&self) -> TextureInfo;

    /// Read one tile of a mip level
    fn read_tile(&self, dest: &mut [u8], mip_level: u32, tile: Tile) -> ImageResult<()>;

    /// Read a whole mip level of `width` x `height` pixels
    fn read_mip_level(&self, dest: &mut [u8], mip_level: u32, width: u32, height: u32) -> ImageResult<()>;

    /// Read the levels `[mip_tail_first_level, num_mip_levels)` packed back to back
    fn read_mip_tail(
        &self,
        dest: &mut [u8],
        mip_tail_first_level: u32,
        num_mip_levels: u32,
        mip_level_dims: &[UVec2],
        pixel_size: u32,
    ) -> ImageResult<()> {
        read_mip_levels(self, dest, mip_tail_first_level, num_mip_levels, mip_level_dims, pixel_size)
    }

    /// Average color used while no tile of the texture is resident
    fn read_base_color(&self) -> ImageResult<Option<[f32; 4]>> {
        Ok(None)
    }

    fn num_tiles_read(&self) -> u64;

    fn num_bytes_read(&self) -> u64;

    fn total_read_time(&self) -> Duration;
}

/// Read mip levels one at a time, packing them back to back into `dest`
pub fn read_mip_levels<S: ImageSource + ?Sized>(
    source: &S,
    dest: &mut [u8],
    first_level: u32,
    num_mip_levels: u32,
    mip_level_dims: &[UVec2],
    pixel_size: u32,
) -> ImageResult<()> {
    let mut offset = 0usize;
    for mip_level in first_level..num_mip_levels {
        let dims = *mip_level_dims
            .get(mip_level as usize)
            .ok_or(ImageError::InvalidMipLevel {
                mip_level,
                num_mip_levels: mip_level_dims.len() as u32,
            })?;
        let size = dims.x as usize * dims.y as usize * pixel_size as usize;
        let available = dest.len().saturating_sub(offset);
        if size > available {
            return Err(ImageError::BufferTooSmall { needed: size, available });
        }
        source.read_mip_level(&mut dest[offset..offset + size], mip_level, dims.x, dims.y)?;
        offset += size;
    }
    Ok(())
}

/// Read statistics kept by image sources
#[derive(Debug, Default)]
pub struct ReadCounters {
    tiles: AtomicU64,
    bytes: AtomicU64,
    nanos: AtomicU64,
}

impl ReadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `read` and count it as `tiles` tiles of `bytes` bytes if it succeeds
    pub fn record<R>(&self, tiles: u64, bytes: u64, read: impl FnOnce() -> ImageResult<R>) -> ImageResult<R> {
        let start = Instant::now();
        let result = read();
        self.nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if result.is_ok() {
            self.tiles.fetch_add(tiles, Ordering::Relaxed);
            self.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        result
    }

    pub fn tiles(&self) -> u64 {
        self.tiles.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn time(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}
