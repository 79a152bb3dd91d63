//! Error types for blobcache
//!
//! One error enum shared by the storage engine and the daemon. Cache misses
//! are modeled as `Error::NotFound` rather than `Option` because several
//! layers (index lookup, data read, TTL expiry) produce a miss and callers
//! need to tell misses apart from real failures.

use thiserror::Error;

/// Common result type for blobcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blobcache
#[derive(Debug, Error)]
pub enum Error {
    /// Key absent, or present but dead per the index validity rules.
    /// Surfaced as a cache miss and never logged.
    #[error("key not found")]
    NotFound,

    /// A data-arena access would cross the end of the file.
    /// Translated to a miss on the read path (the file may have shrunk
    /// between runs); a bug if it ever happens on the write path.
    #[error("out of data range")]
    OutOfRange,

    /// The record header at the given offset did not frame the expected
    /// payload: bad magic or a size mismatch. Indicates corruption.
    #[error("bad record header at offset {offset}")]
    Header { offset: i64 },

    /// Payload bytes did not match the checksum stored in the index.
    #[error("value checksum mismatch")]
    ValueCrc,

    /// Value larger than the per-item limit.
    #[error("value size {size} exceeds maximum {max}")]
    ValueSize { size: i64, max: i64 },

    /// A reservation asked for more bytes than the shard arena holds.
    #[error("not enough space: need {need} bytes, arena is {data_size} bytes")]
    NoSpace { need: i64, data_size: i64 },

    /// Index backend failure (transaction, table, or storage layer).
    #[error("index error: {0}")]
    Index(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an index backend error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is a cache miss
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
