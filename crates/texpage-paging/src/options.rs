//! Loader Options

use serde::{Deserialize, Serialize};

use crate::device_memory::TILE_SIZE_IN_BYTES;
use crate::tile_indexing::TileLayout;
use crate::{PagingError, PagingResult};

/// Demand loading configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Size of the virtual page-id space
    pub num_pages: u32,
    /// Pages `[0, num_page_table_entries)` hold page table entries; the rest are tile pages
    pub num_page_table_entries: u32,
    /// Capacity of the per-launch request list
    pub max_requested_pages: u32,
    /// Capacity of the per-push mapping list
    pub max_filled_pages: u32,
    /// Capacity of the per-launch stale page list
    pub max_stale_pages: u32,
    /// Capacity of the per-push invalidation list
    pub max_invalidated_pages: u32,
    /// Pinned host staging memory in bytes
    pub max_pinned_memory: u64,
    /// Tile memory budget in bytes; 0 is unlimited
    pub max_tex_mem_per_device: u64,
    /// Request worker threads; 0 uses one per core
    pub max_threads: u32,
    /// Device contexts kept in the pool
    pub max_active_streams: u32,
    /// Use sparse textures when the device supports them
    pub use_sparse_textures: bool,
    /// Track LRU values on the device
    pub use_lru_table: bool,
    /// Evict resident tiles when the budget is reached
    pub eviction_active: bool,
    /// Tile page order within a mip level
    pub tile_layout: TileLayout,
    /// Bytes per tile arena
    pub arena_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_pages: 1 << 20,
            num_page_table_entries: 1 << 16,
            max_requested_pages: 8192,
            max_filled_pages: 8192,
            max_stale_pages: 8192,
            max_invalidated_pages: 8192,
            max_pinned_memory: 64 * 1024 * 1024,
            max_tex_mem_per_device: 0,
            max_threads: 0,
            max_active_streams: 4,
            use_sparse_textures: true,
            use_lru_table: true,
            eviction_active: true,
            tile_layout: TileLayout::Footprint,
            arena_size: 2 * 1024 * 1024,
        }
    }
}

impl Options {
    /// Check that the options describe a usable configuration
    pub fn validate(&self) -> PagingResult<()> {
        let invalid = |message: String| Err(PagingError::InvalidOptions(message));

        if self.num_page_table_entries > self.num_pages {
            return invalid(format!(
                "num_page_table_entries ({}) exceeds num_pages ({})",
                self.num_page_table_entries, self.num_pages
            ));
        }
        if self.arena_size < TILE_SIZE_IN_BYTES || self.arena_size % TILE_SIZE_IN_BYTES != 0 {
            return invalid(format!(
                "arena_size ({}) must be a non-zero multiple of the tile size ({TILE_SIZE_IN_BYTES})",
                self.arena_size
            ));
        }
        if self.arena_size / TILE_SIZE_IN_BYTES > 64 {
            return invalid(format!("arena_size ({}) holds more than 64 tiles", self.arena_size));
        }
        if self.max_pinned_memory < TILE_SIZE_IN_BYTES {
            return invalid(format!(
                "max_pinned_memory ({}) cannot stage a single tile",
                self.max_pinned_memory
            ));
        }
        let lists = [
            ("max_requested_pages", self.max_requested_pages),
            ("max_filled_pages", self.max_filled_pages),
            ("max_stale_pages", self.max_stale_pages),
            ("max_invalidated_pages", self.max_invalidated_pages),
            ("max_active_streams", self.max_active_streams),
        ];
        if let Some((name, _)) = lists.iter().find(|(_, value)| *value == 0) {
            return invalid(format!("{name} must be positive"));
        }
        Ok(())
    }

    /// Number of tiles held by one arena
    pub fn tiles_per_arena(&self) -> u32 {
        (self.arena_size / TILE_SIZE_IN_BYTES) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = Options::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.tiles_per_arena(), 32);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: Options =
            serde_json::from_str(r#"{ "num_pages": 4096, "tile_layout": "Linear" }"#).unwrap();
        assert_eq!(options.num_pages, 4096);
        assert_eq!(options.tile_layout, TileLayout::Linear);
        assert_eq!(options.max_filled_pages, 8192);
        assert!(options.eviction_active);
    }

    #[test]
    fn test_invalid_options() {
        let options = Options {
            num_pages: 16,
            num_page_table_entries: 32,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(PagingError::InvalidOptions(_))));

        let options = Options {
            arena_size: 100_000,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = Options {
            arena_size: 128 * TILE_SIZE_IN_BYTES,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = Options {
            max_stale_pages: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
