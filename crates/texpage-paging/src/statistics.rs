//! Loader statistics

use std::time::Duration;

use serde::Serialize;

/// Snapshot of demand loading counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    /// Time spent pulling requests and handing them to the workers
    pub request_processing_time: Duration,
    /// Time spent in fill callbacks, summed over workers
    pub fill_time: Duration,
    /// Tiles read from image sources
    pub num_tiles_read: u64,
    /// Bytes read from image sources
    pub num_bytes_read: u64,
    /// Time image sources spent reading
    pub read_time: Duration,
    pub num_textures: usize,
    /// Bytes of all registered textures at full resolution
    pub virtual_texture_bytes: u64,
    /// Device memory held by the loader
    pub memory_used: u64,
    /// Bytes copied to the device for tiles, mip tails and dense textures
    pub bytes_transferred: u64,
    pub num_evictions: u64,
    pub num_resident_pages: usize,
}

impl Statistics {
    /// Average read throughput in bytes per second
    pub fn read_throughput(&self) -> f64 {
        let seconds = self.read_time.as_secs_f64();
        if seconds > 0.0 {
            self.num_bytes_read as f64 / seconds
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_throughput() {
        let stats = Statistics {
            num_bytes_read: 1000,
            read_time: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(stats.read_throughput(), 2000.0);
        assert_eq!(Statistics::default().read_throughput(), 0.0);
    }

    #[test]
    fn test_serializes_to_json() {
        let stats = Statistics {
            num_textures: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["num_textures"], 3);
        assert_eq!(json["num_evictions"], 0);
    }
}
