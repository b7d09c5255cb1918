//! Tiling adapter for images that can only be read a whole mip level at a time.
//!
//! The first tile request for a level reads the full level from the wrapped
//! source and keeps it; later tiles of that level are cropped from the cached
//! copy. Sources that already read tiles are passed through untouched.

use std::sync::Arc;
use std::time::Duration;

use glam::UVec2;
use parking_lot::{Mutex, RwLock};

use crate::source::read_mip_levels;
use crate::{ImageError, ImageResult, ImageSource, ReadCounters, TextureInfo, Tile};

type LevelCache = Mutex<Option<Arc<Vec<u8>>>>;

#[derive(Default)]
struct TiledState {
    info: TextureInfo,
    pass_through: bool,
    levels: Vec<LevelCache>,
}

pub struct TiledImageSource {
    base: Arc<dyn ImageSource>,
    state: RwLock<TiledState>,
    counters: ReadCounters,
}

impl TiledImageSource {
    pub fn new(base: Arc<dyn ImageSource>) -> Self {
        Self {
            base,
            state: RwLock::new(TiledState::default()),
            counters: ReadCounters::new(),
        }
    }

    fn is_pass_through(&self) -> bool {
        self.state.read().pass_through
    }

    /// Full contents of a mip level, reading it from the base image on first use
    fn level_data(&self, mip_level: u32) -> ImageResult<Arc<Vec<u8>>> {
        let state = self.state.read();
        if !state.info.is_valid {
            return Err(ImageError::NotOpen);
        }
        let info = state.info;
        let cache = state.levels.get(mip_level as usize).ok_or(ImageError::InvalidMipLevel {
            mip_level,
            num_mip_levels: info.num_mip_levels,
        })?;

        let mut level = cache.lock();
        if let Some(data) = level.as_ref() {
            return Ok(data.clone());
        }

        let dims = info.level_dims(mip_level);
        let mut data = vec![0u8; info.level_size_in_bytes(mip_level) as usize];
        self.base.read_mip_level(&mut data, mip_level, dims.x, dims.y)?;
        log::debug!("cached mip level {} ({}x{}) for tiling", mip_level, dims.x, dims.y);

        let data = Arc::new(data);
        *level = Some(data.clone());
        Ok(data)
    }
}

impl ImageSource for TiledImageSource {
    fn open(&self) -> ImageResult<TextureInfo> {
        let mut state = self.state.write();
        if state.info.is_valid {
            return Ok(state.info);
        }

        let mut info = self.base.open()?;
        state.pass_through = info.is_tiled;
        if !info.is_tiled {
            info.is_tiled = true;
            state.levels = (0..info.num_mip_levels).map(|_| Mutex::new(None)).collect();
        }
        state.info = info;
        Ok(info)
    }

    fn close(&self) {
        self.base.close();
        *self.state.write() = TiledState::default();
    }

    fn is_open(&self) -> bool {
        self.state.read().info.is_valid
    }

    fn info(&self) -> TextureInfo {
        let state = self.state.read();
        if state.pass_through {
            self.base.info()
        } else {
            state.info
        }
    }

    fn read_tile(&self, dest: &mut [u8], mip_level: u32, tile: Tile) -> ImageResult<()> {
        if self.is_pass_through() {
            return self.base.read_tile(dest, mip_level, tile);
        }

        let info = self.state.read().info;
        let pixel_size = info.pixel_size() as usize;
        let tile_bytes = tile.size_in_bytes(info.pixel_size());
        if dest.len() < tile_bytes {
            return Err(ImageError::BufferTooSmall {
                needed: tile_bytes,
                available: dest.len(),
            });
        }

        let level_dims = info.level_dims(mip_level);
        let origin = tile.origin();
        if origin.x >= level_dims.x || origin.y >= level_dims.y {
            return Err(ImageError::InvalidTile {
                mip_level,
                x: tile.x,
                y: tile.y,
                width: tile.width,
                height: tile.height,
            });
        }

        self.counters.record(1, tile_bytes as u64, || {
            let level = self.level_data(mip_level)?;
            let copy_width = (tile.width.min(level_dims.x - origin.x)) as usize * pixel_size;
            let rows = tile.height.min(level_dims.y - origin.y) as usize;
            let src_stride = level_dims.x as usize * pixel_size;
            let dst_stride = tile.width as usize * pixel_size;

            for row in 0..rows {
                let src = (origin.y as usize + row) * src_stride + origin.x as usize * pixel_size;
                let dst = row * dst_stride;
                dest[dst..dst + copy_width].copy_from_slice(&level[src..src + copy_width]);
            }
            Ok(())
        })
    }

    fn read_mip_level(&self, dest: &mut [u8], mip_level: u32, width: u32, height: u32) -> ImageResult<()> {
        if !self.is_pass_through() {
            let cached = {
                let state = self.state.read();
                state
                    .levels
                    .get(mip_level as usize)
                    .and_then(|cache| cache.lock().clone())
            };
            if let Some(level) = cached {
                let size = level.len().min(dest.len());
                dest[..size].copy_from_slice(&level[..size]);
                return Ok(());
            }
        }
        self.base.read_mip_level(dest, mip_level, width, height)
    }

    fn read_mip_tail(
        &self,
        dest: &mut [u8],
        mip_tail_first_level: u32,
        num_mip_levels: u32,
        mip_level_dims: &[UVec2],
        pixel_size: u32,
    ) -> ImageResult<()> {
        if self.is_pass_through() {
            return self.base.read_mip_tail(
                dest,
                mip_tail_first_level,
                num_mip_levels,
                mip_level_dims,
                pixel_size,
            );
        }
        read_mip_levels(self, dest, mip_tail_first_level, num_mip_levels, mip_level_dims, pixel_size)
    }

    fn read_base_color(&self) -> ImageResult<Option<[f32; 4]>> {
        self.base.read_base_color()
    }

    fn num_tiles_read(&self) -> u64 {
        if self.is_pass_through() {
            self.base.num_tiles_read()
        } else {
            self.counters.tiles()
        }
    }

    fn num_bytes_read(&self) -> u64 {
        if self.is_pass_through() {
            self.base.num_bytes_read()
        } else {
            self.counters.bytes()
        }
    }

    fn total_read_time(&self) -> Duration {
        if self.is_pass_through() {
            self.base.total_read_time()
        } else {
            self.counters.time()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Base image that can only read whole levels, filled with `(x + y) % 256`
    struct LevelOnlyImage {
        info: TextureInfo,
        level_reads: Mutex<Vec<(u32, u32, u32)>>,
        tile_reads: AtomicU64,
        closes: AtomicUsize,
    }

    impl LevelOnlyImage {
        fn new(info: TextureInfo) -> Arc<Self> {
            Arc::new(Self {
                info,
                level_reads: Mutex::new(Vec::new()),
                tile_reads: AtomicU64::new(0),
                closes: AtomicUsize::new(0),
            })
        }
    }

    impl ImageSource for LevelOnlyImage {
        fn open(&self) -> ImageResult<TextureInfo> {
            Ok(self.info)
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }

        fn is_open(&self) -> bool {
            true
        }

        fn info(&self) -> TextureInfo {
            self.info
        }

        fn read_tile(&self, _dest: &mut [u8], _mip_level: u32, _tile: Tile) -> ImageResult<()> {
            self.tile_reads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn read_mip_level(&self, dest: &mut [u8], mip_level: u32, width: u32, height: u32) -> ImageResult<()> {
            self.level_reads.lock().push((mip_level, width, height));
            let pixel_size = self.info.pixel_size() as usize;
            for y in 0..height as usize {
                for x in 0..width as usize {
                    let start = (y * width as usize + x) * pixel_size;
                    dest[start..start + pixel_size].fill(((x + y) % 256) as u8);
                }
            }
            Ok(())
        }

        fn num_tiles_read(&self) -> u64 {
            13
        }

        fn num_bytes_read(&self) -> u64 {
            0
        }

        fn total_read_time(&self) -> Duration {
            Duration::ZERO
        }
    }

    fn base_info() -> TextureInfo {
        TextureInfo {
            width: 1920,
            height: 1080,
            format: PixelFormat::U8,
            num_channels: 3,
            num_mip_levels: 1,
            is_valid: true,
            is_tiled: false,
        }
    }

    #[test]
    fn test_open_returns_tiled_info() {
        let tiled = TiledImageSource::new(LevelOnlyImage::new(base_info()));
        let info = tiled.open().unwrap();

        let expected = TextureInfo {
            is_tiled: true,
            ..base_info()
        };
        assert_eq!(info, expected);
        assert_eq!(tiled.info(), expected);
    }

    #[test]
    fn test_info_without_open_is_invalid() {
        let tiled = TiledImageSource::new(LevelOnlyImage::new(base_info()));
        assert!(!tiled.info().is_valid);
        assert!(matches!(
            tiled.read_tile(&mut [0; 16], 0, Tile { x: 0, y: 0, width: 1, height: 1 }),
            Err(ImageError::NotOpen)
        ));
    }

    #[test]
    fn test_close_resets_info() {
        let base = LevelOnlyImage::new(base_info());
        let tiled = TiledImageSource::new(base.clone());
        assert!(tiled.open().unwrap().is_valid);

        tiled.close();
        assert!(!tiled.info().is_valid);
        assert_eq!(base.closes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_read_tile_crops_full_level() {
        let base = LevelOnlyImage::new(base_info());
        let tiled = TiledImageSource::new(base.clone());
        tiled.open().unwrap();

        let tile = Tile { x: 0, y: 0, width: 64, height: 64 };
        let mut dest = vec![0u8; 64 * 64 * 4];
        tiled.read_tile(&mut dest, 0, tile).unwrap();

        let mut level = vec![0u8; 1920 * 1080 * 3];
        base.read_mip_level(&mut level, 0, 1920, 1080).unwrap();
        for y in 0..64 {
            let row = &dest[y * 64 * 3..(y + 1) * 64 * 3];
            assert_eq!(row, &level[y * 1920 * 3..y * 1920 * 3 + 64 * 3]);
        }
    }

    #[test]
    fn test_tracks_tile_read_count() {
        let base = LevelOnlyImage::new(base_info());
        let tiled = TiledImageSource::new(base.clone());
        tiled.open().unwrap();

        let mut dest = vec![0u8; 64 * 64 * 4];
        tiled.read_tile(&mut dest, 0, Tile { x: 0, y: 0, width: 64, height: 64 }).unwrap();
        tiled.read_tile(&mut dest, 0, Tile { x: 1, y: 0, width: 64, height: 64 }).unwrap();

        assert_eq!(tiled.num_tiles_read(), 2);
        assert_eq!(tiled.num_bytes_read(), 2 * 64 * 64 * 3);
        assert_eq!(*base.level_reads.lock(), vec![(0, 1920, 1080)]);

        // Second tile starts at pixel 64
        assert_eq!(dest[0], 64);
    }

    #[test]
    fn test_edge_tile_is_clipped() {
        let tiled = TiledImageSource::new(LevelOnlyImage::new(base_info()));
        tiled.open().unwrap();

        // 1080 = 16 * 64 + 56: the last row of tiles has 56 valid rows
        let mut dest = vec![0xffu8; 64 * 64 * 3];
        tiled.read_tile(&mut dest, 0, Tile { x: 0, y: 16, width: 64, height: 64 }).unwrap();
        assert_eq!(dest[55 * 64 * 3], ((16 * 64 + 55) % 256) as u8);
        assert_eq!(dest[56 * 64 * 3], 0xff);

        assert!(matches!(
            tiled.read_tile(&mut dest, 0, Tile { x: 0, y: 17, width: 64, height: 64 }),
            Err(ImageError::InvalidTile { .. })
        ));
    }

    #[test]
    fn test_read_mip_tail_reads_each_level_once() {
        let info = TextureInfo {
            width: 16,
            height: 16,
            num_mip_levels: 5,
            ..base_info()
        };
        let base = LevelOnlyImage::new(info);
        let tiled = TiledImageSource::new(base.clone());
        tiled.open().unwrap();

        let dims: Vec<UVec2> = (0..5).map(|level| info.level_dims(level)).collect();
        let mut dest = vec![0u8; crate::texture_size_in_bytes(&info) as usize];
        tiled.read_mip_tail(&mut dest, 0, 5, &dims, info.pixel_size()).unwrap();

        assert_eq!(
            *base.level_reads.lock(),
            vec![(0, 16, 16), (1, 8, 8), (2, 4, 4), (3, 2, 2), (4, 1, 1)]
        );
    }

    #[test]
    fn test_pass_through_for_tiled_base() {
        let info = TextureInfo {
            is_tiled: true,
            ..base_info()
        };
        let base = LevelOnlyImage::new(info);
        let tiled = TiledImageSource::new(base.clone());
        tiled.open().unwrap();

        let tile = Tile { x: 2, y: 3, width: 16, height: 16 };
        tiled.read_tile(&mut [0u8; 4], 1, tile).unwrap();
        assert_eq!(base.tile_reads.load(Ordering::Relaxed), 1);
        assert_eq!(tiled.num_tiles_read(), 13);
        assert!(tiled.info().is_tiled);
        assert!(base.level_reads.lock().is_empty());
    }
}
