//! # Texpage Core
//!
//! Host-side building blocks for the texpage demand-paging engine.
//!
//! - **Memory**: item pools, a ring suballocator for staging memory, and
//!   usage statistics

pub mod memory;

pub use memory::{ItemPool, MemoryBlock, MemoryStats, RingSuballocator};
