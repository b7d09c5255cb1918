//! # Texpage Image
//!
//! The image data provider side of demand loading.
//!
//! ## Features
//! - [`ImageSource`] trait: per-tile and per-mip-level pixel reads
//! - [`TiledImageSource`]: serves tiles from sources that can only read whole levels
//! - [`CheckerBoardImage`]: procedural test image

mod checkerboard;
mod info;
mod source;
mod tiled;

pub use checkerboard::CheckerBoardImage;
pub use info::{PixelFormat, TextureInfo, Tile, texture_size_in_bytes};
pub use source::{ImageSource, ReadCounters, read_mip_levels};
pub use tiled::TiledImageSource;

use thiserror::Error;

/// Image read errors
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image is not open")]
    NotOpen,

    #[error("Invalid tile ({x}, {y}) {width}x{height} for mip level {mip_level}")]
    InvalidTile {
        mip_level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("Invalid mip level {mip_level} (image has {num_mip_levels})")]
    InvalidMipLevel { mip_level: u32, num_mip_levels: u32 },

    #[error("Destination buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Read failed: {0}")]
    Read(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for image operations
pub type ImageResult<T> = Result<T, ImageError>;
