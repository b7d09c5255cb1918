//! # Texpage Paging
//!
//! Demand-paged virtual texturing. Textures are sparse tile grids in device
//! memory; only tiles that sampling code actually touched are loaded, under a
//! fixed memory budget, and unused tiles are evicted by least-recently-used
//! pressure.
//!
//! ## Features
//! - **Page table manager**: the flat page-id space split into page table
//!   entries and tile pages
//! - **Paging system**: residency, LRU state and the push/pull protocol with
//!   the device
//! - **Device memory manager**: tile arenas under a budget and pooled device
//!   contexts
//! - **Request processor**: worker pool turning page misses into resident tiles
//! - **Demand loader**: textures and resources on top of the page loader
//!
//! ## Frame cycle
//! ```text
//! launch_prepare ─► render launch ─► process_requests ─► workers fill tiles
//!       ▲                                                      │
//!       └──────────────── mappings pushed next frame ◄─────────┘
//! ```

pub mod demand_loader;
pub mod device_context;
pub mod device_memory;
mod handlers;
pub mod kernels;
pub mod options;
pub mod page_loader;
pub mod page_table;
pub mod paging_system;
pub mod request_processor;
pub mod sampler;
pub mod statistics;
pub mod texture;
pub mod ticket;
pub mod tile_indexing;

pub use demand_loader::DemandLoader;
pub use device_context::{ContextFlags, DeviceContext};
pub use device_memory::{DeviceMemoryManager, TILE_SIZE_IN_BYTES, TileBlockDesc, TileBlockHandle};
pub use handlers::ResourceCallback;
pub use options::Options;
pub use page_loader::DemandPageLoader;
pub use page_table::PageTableManager;
pub use paging_system::{
    InvalidationPredicate, MAX_LRU_VAL, NON_EVICTABLE_LRU_VAL, PageMapping, PagingSystem,
};
pub use request_processor::{FillOutcome, RequestHandler, RequestProcessor};
pub use sampler::TextureSampler;
pub use statistics::Statistics;
pub use texture::{NO_BASE_COLOR, TextureDescriptor};
pub use ticket::Ticket;
pub use tile_indexing::{AddressMode, TileLayout};

use texpage_image::ImageError;
use texpage_platform::DeviceError;
use thiserror::Error;

/// Paging errors
#[derive(Error, Debug)]
pub enum PagingError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Page space exhausted: {requested} pages requested, {available} available")]
    PageSpaceExhausted { requested: u32, available: u32 },

    #[error("Tile block of {num_tiles} tiles does not fit in an arena of {arena_tiles}")]
    TilePoolExhausted { num_tiles: u32, arena_tiles: u32 },

    #[error("No resource owns page {0}")]
    UnknownPage(u32),

    #[error("Unknown texture {0}")]
    UnknownTexture(u32),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Resource callback failed: {0}")]
    Callback(#[from] anyhow::Error),
}

/// Result type for paging operations
pub type PagingResult<T> = Result<T, PagingError>;
