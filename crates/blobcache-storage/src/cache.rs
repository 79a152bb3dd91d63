//! Cache facade
//!
//! Owns a fixed array of shards plus the hash ring routing keys to them.
//! Handles the sizing math on open and removes the files of shards that a
//! smaller configuration no longer uses.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use blobcache_common::{
    Allocator, BufferPool, CacheMetrics, CacheStats, Error, Item, Result, MAX_SHARDS,
    MAX_VALUE_SIZE, MIN_SHARD_SIZE,
};
use tracing::info;

use crate::ring::HashRing;
use crate::shard::{Shard, ShardOptions};

/// Options for opening a cache
#[derive(Clone)]
pub struct CacheOptions {
    /// Number of shards, clamped to `[1, 128]`
    pub shard_num: usize,
    /// Total cache size in bytes, split evenly across shards
    pub size: i64,
    /// Cache-wide TTL in seconds; 0 = none
    pub ttl: i64,
    /// Value-buffer allocator shared by all shards; a pool is created
    /// when absent
    pub allocator: Option<Arc<dyn Allocator>>,
    /// Skip the background scanners (tests, benchmarks)
    pub disable_gc: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            shard_num: 16,
            size: 32 * MAX_VALUE_SIZE,
            ttl: 0,
            allocator: None,
            disable_gc: false,
        }
    }
}

/// A sharded persistent blob cache rooted at one directory
pub struct Cache {
    ring: HashRing,
    shards: Vec<Shard>,
    options: CacheOptions,
}

impl Cache {
    /// Open or create a cache in directory `path`.
    ///
    /// Shard files are named `shard.NNN.idx` / `shard.NNN.dat`; files of
    /// slots beyond the configured shard count are deleted so a shrink does
    /// not leave stale data behind.
    pub fn open(path: impl AsRef<Path>, mut options: CacheOptions) -> Result<Cache> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;

        if options.shard_num == 0 {
            options.shard_num = CacheOptions::default().shard_num;
        }
        if options.shard_num > MAX_SHARDS {
            options.shard_num = MAX_SHARDS;
        }
        if options.size / (options.shard_num as i64) < MIN_SHARD_SIZE {
            options.shard_num = ((options.size / MIN_SHARD_SIZE).max(1)) as usize;
        }
        let allocator = options
            .allocator
            .get_or_insert_with(|| Arc::new(BufferPool::new()))
            .clone();

        let shard_size = options.size / options.shard_num as i64;
        let mut shards = Vec::with_capacity(options.shard_num);
        for i in 0..MAX_SHARDS {
            let base = path.join(format!("shard.{i:03}"));
            if i >= options.shard_num {
                // leftovers from a bigger configuration
                let _ = fs::remove_file(path.join(format!("shard.{i:03}.idx")));
                let _ = fs::remove_file(path.join(format!("shard.{i:03}.dat")));
                continue;
            }
            shards.push(Shard::open(
                &base,
                ShardOptions {
                    size: shard_size,
                    ttl: options.ttl,
                    allocator: Some(Arc::clone(&allocator)),
                    disable_gc: options.disable_gc,
                },
            )?);
        }
        info!(
            path = %path.display(),
            shards = options.shard_num,
            shard_size,
            "cache opened"
        );

        Ok(Cache {
            ring: HashRing::new(shards.len()),
            shards,
            options,
        })
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[self.ring.get(key)]
    }

    /// Store an item, rejecting values above the per-item limit
    pub fn set(&self, item: &Item) -> Result<()> {
        if item.len() as i64 > MAX_VALUE_SIZE {
            return Err(Error::ValueSize {
                size: item.len() as i64,
                max: MAX_VALUE_SIZE,
            });
        }
        self.shard(&item.key).set(item)
    }

    /// Fetch an item
    pub fn get(&self, key: &str) -> Result<Item> {
        self.shard(key).get(key)
    }

    /// Drop a key
    pub fn del(&self, key: &str) -> Result<()> {
        self.shard(key).del(key)
    }

    /// The options the cache was opened with (after clamping)
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Counters summed over all shards
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let mut m = CacheMetrics::default();
        for shard in &self.shards {
            m.merge(&shard.metrics());
        }
        m
    }

    /// Occupancy summed over all shards
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut st = CacheStats::default();
        for shard in &self.shards {
            st.merge(&shard.stats());
        }
        st
    }

    /// Per-shard counter snapshots
    #[must_use]
    pub fn metrics_by_shard(&self) -> Vec<CacheMetrics> {
        self.shards.iter().map(Shard::metrics).collect()
    }

    /// Per-shard occupancy snapshots
    #[must_use]
    pub fn stats_by_shard(&self) -> Vec<CacheStats> {
        self.shards.iter().map(Shard::stats).collect()
    }

    /// Stop all scanners and close every shard; the last error wins
    pub fn close(&self) -> Result<()> {
        let mut result = Ok(());
        for shard in &self.shards {
            if let Err(e) = shard.close() {
                result = Err(e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    fn small_options(shard_num: usize, size: i64) -> CacheOptions {
        CacheOptions {
            shard_num,
            size,
            ttl: 0,
            allocator: None,
            disable_gc: true,
        }
    }

    #[test]
    fn test_set_get_del_cycle_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), small_options(2, 2 * MIN_SHARD_SIZE)).unwrap();

        let mut rng = rand::thread_rng();
        let mut value = vec![0u8; 100];
        let n = 1000i64;

        for _ in 0..n {
            let key = format!("{:x}", rng.gen::<u64>());
            rng.fill_bytes(&mut value);

            cache.set(&Item::new(key.clone(), value.clone())).unwrap();
            let item = cache.get(&key).unwrap();
            assert_eq!(item.value(), value.as_slice());
            drop(item);

            cache.del(&key).unwrap();
            assert!(matches!(cache.get(&key), Err(Error::NotFound)));
        }

        let m = cache.metrics();
        assert_eq!(m.get_total, 2 * n);
        assert_eq!(m.get_hits, n);
        assert_eq!(m.get_misses, n);
        assert_eq!(m.set_total, n);
        assert_eq!(m.del_total, n);
        cache.close().unwrap();
    }

    #[test]
    fn test_value_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), small_options(1, MIN_SHARD_SIZE)).unwrap();

        let mut item = Item::new("big", Vec::new());
        assert!(cache.set(&item).is_ok());

        // the limit check fires before any shard work
        item = Item::new("big", vec![0u8; (MAX_VALUE_SIZE + 1) as usize]);
        assert!(matches!(cache.set(&item), Err(Error::ValueSize { .. })));
        cache.close().unwrap();
    }

    #[test]
    fn test_shard_count_clamped_by_size() {
        let dir = tempfile::tempdir().unwrap();
        // room for exactly two minimum shards
        let cache = Cache::open(dir.path(), small_options(16, 2 * MIN_SHARD_SIZE)).unwrap();
        assert_eq!(cache.options().shard_num, 2);
        assert_eq!(cache.stats_by_shard().len(), 2);
        cache.close().unwrap();
    }

    #[test]
    fn test_shrink_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::open(dir.path(), small_options(4, 4 * MIN_SHARD_SIZE)).unwrap();
            cache.close().unwrap();
        }
        assert!(dir.path().join("shard.003.dat").exists());

        {
            let cache = Cache::open(dir.path(), small_options(2, 2 * MIN_SHARD_SIZE)).unwrap();
            cache.close().unwrap();
        }
        assert!(dir.path().join("shard.001.dat").exists());
        assert!(!dir.path().join("shard.002.dat").exists());
        assert!(!dir.path().join("shard.003.idx").exists());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut expected = Vec::new();
        {
            let cache = Cache::open(dir.path(), small_options(2, 2 * MIN_SHARD_SIZE)).unwrap();
            let mut rng = rand::thread_rng();
            for i in 0..50 {
                let key = format!("persist-{i}");
                let mut value = vec![0u8; 256];
                rng.fill_bytes(&mut value);
                cache.set(&Item::new(key.clone(), value.clone())).unwrap();
                expected.push((key, value));
            }
            cache.close().unwrap();
        }

        let cache = Cache::open(dir.path(), small_options(2, 2 * MIN_SHARD_SIZE)).unwrap();
        for (key, value) in &expected {
            let item = cache.get(key).unwrap();
            assert_eq!(item.value(), value.as_slice(), "{key}");
        }
        cache.close().unwrap();
    }
}
