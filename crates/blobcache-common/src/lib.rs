//! Shared types for blobcache
//!
//! This crate defines the pieces every other crate needs:
//! - The common [`Error`]/[`Result`] types
//! - Cache-wide limits, the [`Item`] handed across the cache boundary,
//!   and the metrics/stats snapshot types
//! - The size-classed [`BufferPool`] used to recycle value buffers

pub mod error;
pub mod pool;
pub mod types;

pub use error::{Error, Result};
pub use pool::{Allocator, BufferPool, PoolMetrics};
pub use types::{
    unix_now, CacheMetrics, CacheStats, Item, MAX_SHARDS, MAX_VALUE_SIZE, MIN_SHARD_SIZE,
};
