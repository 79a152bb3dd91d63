//! Cache shard
//!
//! The unit of concurrency: one [`IndexStore`] and one [`DataFile`] sharing a
//! basename, mediated by a reader/writer lock, plus a background scanner
//! that purges expired and wrapped-over index entries and refreshes the
//! occupancy stats.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blobcache_common::{
    unix_now, Allocator, BufferPool, CacheMetrics, CacheStats, Error, Item, Result,
    MIN_SHARD_SIZE,
};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::data_file::DataFile;
use crate::index::IndexStore;

const INDEX_SUFFIX: &str = ".idx";
const DATA_SUFFIX: &str = ".dat";

/// Entries examined per scanner tick
const SCAN_CHUNK: usize = 100;

/// Pause between scanner ticks (~2000 entries/s)
const TICK_SLEEP: Duration = Duration::from_millis(50);

/// Minimum time between two full index passes
const FULL_PASS_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Entries sampled at open to estimate the bytes-in-use stat
const OPEN_SAMPLE: usize = 10_000;

/// Options for opening one shard
#[derive(Clone)]
pub struct ShardOptions {
    /// Data arena size in bytes
    pub size: i64,
    /// Shard-wide TTL in seconds; 0 = none
    pub ttl: i64,
    /// Value-buffer allocator; a private pool is created when absent
    pub allocator: Option<Arc<dyn Allocator>>,
    /// Skip spawning the background scanner (tests, benchmarks)
    pub disable_gc: bool,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            size: MIN_SHARD_SIZE,
            ttl: 0,
            allocator: None,
            disable_gc: false,
        }
    }
}

#[derive(Default)]
struct ShardMetrics {
    get_total: AtomicI64,
    get_hits: AtomicI64,
    get_misses: AtomicI64,
    get_expired: AtomicI64,
    set_total: AtomicI64,
    del_total: AtomicI64,
    expired: AtomicI64,
    evicted: AtomicI64,
    evicted_age: AtomicI64,
}

impl ShardMetrics {
    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            get_total: self.get_total.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            get_misses: self.get_misses.load(Ordering::Relaxed),
            get_expired: self.get_expired.load(Ordering::Relaxed),
            set_total: self.set_total.load(Ordering::Relaxed),
            del_total: self.del_total.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            evicted_age: self.evicted_age.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct ShardStats {
    keys: AtomicU64,
    bytes: AtomicU64,
    last_update: AtomicI64,
}

/// Progress of one scanner pass over the index
#[derive(Clone, Debug, Default)]
struct GcScan {
    scanned: u64,
    purged: u64,
    active: u64,
    active_bytes: u64,
    last_key: String,
}

/// Stop signal shared with the scanner thread
#[derive(Default)]
struct GcSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl GcSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Sleep up to `timeout`; returns true if the stop signal fired
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        self.cond.wait_for(&mut stopped, timeout);
        *stopped
    }
}

struct ShardInner {
    index: IndexStore,
    data: DataFile,
    ttl: i64,
    allocator: Arc<dyn Allocator>,
    lock: RwLock<()>,
    metrics: ShardMetrics,
    stats: ShardStats,
}

/// One index + data pair, the unit of on-disk partitioning
pub struct Shard {
    inner: Arc<ShardInner>,
    gc_signal: Arc<GcSignal>,
    gc_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = base.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl Shard {
    /// Open the shard stored at `<base>.idx` / `<base>.dat`.
    ///
    /// Loads both files, seeds the occupancy stats from a bounded sample of
    /// the index, and spawns the scanner thread unless disabled.
    pub fn open(base: impl AsRef<Path>, mut options: ShardOptions) -> Result<Shard> {
        let base = base.as_ref();
        if options.size <= 0 {
            options.size = MIN_SHARD_SIZE;
        }
        let allocator = options
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(BufferPool::new()));

        let index = IndexStore::open(with_suffix(base, INDEX_SUFFIX), options.size)?;
        let data = DataFile::open(with_suffix(base, DATA_SUFFIX), options.size)?;

        let inner = Arc::new(ShardInner {
            index,
            data,
            ttl: options.ttl,
            allocator,
            lock: RwLock::new(()),
            metrics: ShardMetrics::default(),
            stats: ShardStats::default(),
        });

        // estimate bytes-in-use from a sample so stats are sane before the
        // first full scanner pass completes
        let keys = inner.index.key_count()?;
        let mut scan = GcScan::default();
        inner.scan_keys(OPEN_SAMPLE, &mut scan)?;
        let bytes = if scan.active > 0 {
            (keys as f64 * (scan.active_bytes as f64 / scan.active as f64)) as u64
        } else {
            0
        };
        inner.stats.keys.store(keys, Ordering::Relaxed);
        inner.stats.bytes.store(bytes, Ordering::Relaxed);
        inner.stats.last_update.store(unix_now(), Ordering::Relaxed);

        let shard = Shard {
            inner,
            gc_signal: Arc::new(GcSignal::default()),
            gc_handle: Mutex::new(None),
        };
        if !options.disable_gc {
            shard.spawn_gc()?;
        }
        Ok(shard)
    }

    fn spawn_gc(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let signal = Arc::clone(&self.gc_signal);
        let handle = thread::Builder::new()
            .name("blobcache-gc".into())
            .spawn(move || gc_loop(&inner, &signal))?;
        *self.gc_handle.lock() = Some(handle);
        Ok(())
    }

    /// Store an item
    pub fn set(&self, item: &Item) -> Result<()> {
        self.inner.set(item)
    }

    /// Fetch an item; the returned value buffer comes from the allocator
    pub fn get(&self, key: &str) -> Result<Item> {
        self.inner.get(key)
    }

    /// Drop a key. The arena bytes are reclaimed later by head wrap.
    pub fn del(&self, key: &str) -> Result<()> {
        self.inner.del(key)
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.inner.metrics.snapshot()
    }

    /// Occupancy snapshot (refreshed by the scanner)
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            keys: self.inner.stats.keys.load(Ordering::Relaxed),
            bytes: self.inner.stats.bytes.load(Ordering::Relaxed),
            last_update: self.inner.stats.last_update.load(Ordering::Relaxed),
        }
    }

    /// Stop the scanner and close both stores
    pub fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        self.gc_signal.stop();
        if let Some(handle) = self.gc_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ShardInner {
    fn set(&self, item: &Item) -> Result<()> {
        self.metrics.set_total.fetch_add(1, Ordering::Relaxed);
        let _exclusive = self.lock.write();

        let mut entry = self.index.reserve(item.len() as i32)?;
        entry.ttl = item.ttl;
        entry.flags = item.flags;
        entry.crc32 = crc32fast::hash(item.value());

        // data first, index second: a reader that finds the entry always
        // sees the bytes it frames
        self.data.write(entry.offset, item.value())?;
        self.index.put(&item.key, &entry)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Item> {
        self.metrics.get_total.fetch_add(1, Ordering::Relaxed);
        let _shared = self.lock.read();

        let entry = match self.index.get(key) {
            Ok(entry) => entry,
            Err(e) => {
                if e.is_not_found() {
                    self.metrics.get_misses.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        let age = unix_now() - entry.timestamp;
        if self.is_expired(&entry, age) {
            self.metrics.get_misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.get_expired.fetch_add(1, Ordering::Relaxed);
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.index.del(key) {
                debug!(key, error = %e, "dropping expired entry failed");
            }
            return Err(Error::NotFound);
        }

        let mut item = Item::pooled(Arc::clone(&self.allocator), entry.value_size as usize);
        item.key = key.to_string();
        item.timestamp = entry.timestamp;
        item.ttl = entry.ttl;
        item.flags = entry.flags;

        match self.data.read(entry.offset, item.value_mut()) {
            Ok(()) => {}
            // the arena shrank between runs
            Err(Error::OutOfRange) => {
                self.metrics.get_misses.fetch_add(1, Ordering::Relaxed);
                return Err(Error::NotFound);
            }
            Err(e) => return Err(e),
        }

        if entry.crc32 != 0 && crc32fast::hash(item.value()) != entry.crc32 {
            return Err(Error::ValueCrc);
        }
        self.metrics.get_hits.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    fn del(&self, key: &str) -> Result<()> {
        self.metrics.del_total.fetch_add(1, Ordering::Relaxed);
        // shared is enough: the index serializes its own writes
        let _shared = self.lock.read();
        self.index.del(key)
    }

    fn is_expired(&self, entry: &crate::index::IndexEntry, age: i64) -> bool {
        (self.ttl > 0 && age >= self.ttl) || (entry.ttl > 0 && age > i64::from(entry.ttl))
    }

    /// Scan up to `max` entries from `st.last_key`, dropping expired and
    /// wrapped-over ones and accounting the live remainder.
    fn scan_keys(&self, max: usize, st: &mut GcScan) -> Result<()> {
        let now = unix_now();
        let meta = self.index.metadata();
        let start = st.last_key.clone();
        let mut pending_deletes: Vec<String> = Vec::new();

        let scan_result = self.index.iter(&start, max, |key, entry| {
            st.scanned += 1;
            st.last_key.clear();
            st.last_key.push_str(key);

            let age = now - entry.timestamp;
            if self.is_expired(&entry, age) {
                st.purged += 1;
                self.metrics.expired.fetch_add(1, Ordering::Relaxed);
                pending_deletes.push(key.to_string());
                return Ok(());
            }
            if !meta.is_valid(&entry) {
                // lapped by the write head since it was stored
                st.purged += 1;
                self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .evicted_age
                    .store(now - entry.timestamp, Ordering::Relaxed);
                pending_deletes.push(key.to_string());
                return Ok(());
            }
            st.active += 1;
            st.active_bytes += key.len() as u64 + entry.total_size() as u64;
            Ok(())
        });

        let delete_result = self.index.del_many(&pending_deletes);
        scan_result.and(delete_result)
    }
}

/// Scanner loop: advisory cleanup of entries the validity rules would
/// reject anyway, plus stats refresh. Rate-limited so idle shards are not
/// saturated with index reads.
fn gc_loop(inner: &ShardInner, signal: &GcSignal) {
    let mut scan = GcScan::default();
    let mut last_finish = Instant::now();

    loop {
        if signal.wait(TICK_SLEEP) {
            return;
        }
        let before = scan.scanned;
        if let Err(e) = inner.scan_keys(SCAN_CHUNK, &mut scan) {
            warn!(error = %e, "gc scan failed");
            continue;
        }
        if scan.scanned - before >= SCAN_CHUNK as u64 {
            // mid-pass, keep going next tick
            continue;
        }

        // reached the end of the keyspace: publish and start over
        let cost = last_finish.elapsed();
        debug!(
            scanned = scan.scanned,
            purged = scan.purged,
            cost_ms = cost.as_millis() as u64,
            "gc pass finished"
        );
        inner.stats.keys.store(scan.active, Ordering::Relaxed);
        inner
            .stats
            .bytes
            .store(scan.active_bytes, Ordering::Relaxed);
        inner.stats.last_update.store(unix_now(), Ordering::Relaxed);
        scan = GcScan::default();

        if cost < FULL_PASS_MIN_INTERVAL && signal.wait(FULL_PASS_MIN_INTERVAL - cost) {
            return;
        }
        last_finish = Instant::now();
    }
}
