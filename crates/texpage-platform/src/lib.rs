//! # Texpage Platform
//!
//! Device abstraction layer for the texpage demand-paging engine.
//!
//! This crate provides:
//! - **Device**: a host-emulated GPU with a byte-addressed device heap and a
//!   capability query
//! - **Stream**: ordered asynchronous command queues with events and host
//!   callbacks
//! - **Pinned memory**: a bounded, ring-allocated staging pool for host to
//!   device copies
//! - **Threading**: named service threads
//! - **Timers**: stopwatches and time accumulators for statistics

pub mod device;
pub mod pinned;
pub mod stream;
pub mod threading;
pub mod timer;

pub use device::{Device, DeviceCapabilities, DevicePtr};
pub use pinned::{PinnedBlock, PinnedMemoryPool};
pub use stream::{Event, Stream};
pub use threading::Thread;
pub use timer::{Stopwatch, TimeAccumulator};

use thiserror::Error;

/// Device-level errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Invalid device address {address:#x} (+{len} bytes)")]
    InvalidAddress { address: u64, len: usize },

    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("Out of pinned memory: requested {requested} bytes from a {capacity} byte pool")]
    OutOfPinnedMemory { requested: usize, capacity: usize },

    #[error("Stream {0} is closed")]
    StreamClosed(u64),

    #[error("Stream {stream} faulted: {message}")]
    StreamFault { stream: u64, message: String },

    #[error("Kernel '{name}' failed: {message}")]
    Launch { name: String, message: String },

    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
