//! Cache-wide limits, the cache item, and metric/stat snapshots

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::pool::Allocator;

/// Maximum number of shards a cache may be split into
pub const MAX_SHARDS: usize = 128;

/// Maximum size of a single value (128 MiB)
pub const MAX_VALUE_SIZE: i64 = 128 << 20;

/// Minimum data-arena size of one shard: one max-size value plus one page
pub const MIN_SHARD_SIZE: i64 = MAX_VALUE_SIZE + 4096;

/// Current Unix time in seconds
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// An item moving across the cache boundary.
///
/// On the read path the value buffer is borrowed from the allocator pool and
/// returned to it when the item is dropped. On the write path callers build
/// an item around any buffer; pooling it is optional.
pub struct Item {
    pub key: String,
    /// Unix seconds the item was stored at (set by the cache on read)
    pub timestamp: i64,
    /// Per-item TTL in seconds; 0 means no per-item expiry
    pub ttl: u32,
    /// Opaque client flags, stored and returned verbatim
    pub flags: u32,
    value: Option<Vec<u8>>,
    allocator: Option<Arc<dyn Allocator>>,
}

impl Item {
    /// Create an item around an owned buffer (not pooled)
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            timestamp: 0,
            ttl: 0,
            flags: 0,
            value: Some(value),
            allocator: None,
        }
    }

    /// Create an item whose value buffer of length `n` comes from `allocator`
    /// and goes back to it on drop
    pub fn pooled(allocator: Arc<dyn Allocator>, n: usize) -> Self {
        let value = allocator.alloc(n);
        Self {
            key: String::new(),
            timestamp: 0,
            ttl: 0,
            flags: 0,
            value: Some(value),
            allocator: Some(allocator),
        }
    }

    /// The value bytes
    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.value.as_deref().unwrap_or(&[])
    }

    /// Mutable access to the value bytes (used to read from disk in place)
    pub fn value_mut(&mut self) -> &mut [u8] {
        self.value.as_deref_mut().unwrap_or(&mut [])
    }

    /// Value length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Item {
    fn drop(&mut self) {
        if let (Some(buf), Some(pool)) = (self.value.take(), self.allocator.take()) {
            pool.free(buf);
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("len", &self.len())
            .field("timestamp", &self.timestamp)
            .field("ttl", &self.ttl)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Counter snapshot of one shard (or a whole cache, when summed)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Number of get requests
    pub get_total: i64,
    /// Number of gets served from the data arena
    pub get_hits: i64,
    /// Number of gets that found nothing
    pub get_misses: i64,
    /// Number of gets that hit an expired item
    pub get_expired: i64,
    /// Number of set requests
    pub set_total: i64,
    /// Number of delete requests
    pub del_total: i64,
    /// Number of items dropped because their TTL passed
    pub expired: i64,
    /// Number of items dropped because the write head lapped them
    pub evicted: i64,
    /// Age in seconds of the most recently evicted item
    pub evicted_age: i64,
}

impl CacheMetrics {
    /// Fold another shard's counters into this snapshot
    pub fn merge(&mut self, o: &CacheMetrics) {
        self.get_total += o.get_total;
        self.get_hits += o.get_hits;
        self.get_misses += o.get_misses;
        self.get_expired += o.get_expired;
        self.set_total += o.set_total;
        self.del_total += o.del_total;
        self.expired += o.expired;
        self.evicted += o.evicted;
        // keep the smallest positive age: the shard evicting the
        // youngest items is the one under the most write pressure
        if self.evicted_age <= 0 || (o.evicted_age > 0 && o.evicted_age < self.evicted_age) {
            self.evicted_age = o.evicted_age;
        }
    }
}

/// Occupancy snapshot of one shard, refreshed by its GC pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of live keys
    pub keys: u64,
    /// Bytes used by live keys, index and framing included
    pub bytes: u64,
    /// Unix seconds the numbers were last refreshed
    pub last_update: i64,
}

impl CacheStats {
    /// Fold another shard's snapshot into this one
    pub fn merge(&mut self, o: &CacheStats) {
        self.keys += o.keys;
        self.bytes += o.bytes;
        // report the stalest refresh across shards
        if self.last_update == 0 || o.last_update < self.last_update {
            self.last_update = o.last_update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_merge() {
        let mut m1 = CacheMetrics::default();
        let m2 = CacheMetrics {
            get_total: 1,
            get_hits: 1,
            get_misses: 1,
            get_expired: 1,
            set_total: 1,
            del_total: 1,
            expired: 1,
            evicted: 1,
            evicted_age: 1,
        };
        m1.merge(&m2);
        assert_eq!(m1, m2);
    }

    #[test]
    fn test_metrics_merge_keeps_min_positive_age() {
        let mut m = CacheMetrics {
            evicted_age: 10,
            ..Default::default()
        };
        m.merge(&CacheMetrics {
            evicted_age: 3,
            ..Default::default()
        });
        assert_eq!(m.evicted_age, 3);
        m.merge(&CacheMetrics::default());
        assert_eq!(m.evicted_age, 3);
    }

    #[test]
    fn test_stats_merge() {
        let mut st = CacheStats::default();
        st.merge(&CacheStats {
            keys: 2,
            bytes: 100,
            last_update: 50,
        });
        st.merge(&CacheStats {
            keys: 3,
            bytes: 200,
            last_update: 40,
        });
        assert_eq!(st.keys, 5);
        assert_eq!(st.bytes, 300);
        assert_eq!(st.last_update, 40);
    }

    #[test]
    fn test_item_plain_buffer() {
        let mut item = Item::new("k", vec![1, 2, 3]);
        assert_eq!(item.value(), &[1, 2, 3]);
        item.value_mut()[0] = 9;
        assert_eq!(item.value(), &[9, 2, 3]);
        assert_eq!(item.len(), 3);
    }
}
