//! Persistent key index
//!
//! Maps keys to arena locations and owns the circular allocation state of the
//! shard. Backed by an embedded ordered KV store with two tables: `"meta"`
//! holds the single [`IndexMeta`] record, `"data"` one [`IndexEntry`] per
//! key. Write transactions run without fsync; losing the tail of recent
//! index writes on a crash makes entries undiscoverable but never corrupts
//! anything, because readers re-validate every entry against the meta.

use std::path::Path;

use blobcache_common::{unix_now, Error, Result};
use parking_lot::RwLock;
use redb::{
    Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use serde::{Deserialize, Serialize};

use crate::data_file::RECORD_HEADER_SIZE;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("data");

/// Key of the meta record inside the meta table
const META_KEY: &str = "indexmeta";

/// Map any backend error into [`Error::Index`]
fn ix(e: impl std::fmt::Display) -> Error {
    Error::index(e.to_string())
}

/// Location and attributes of one stored value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Arena wrap count at allocation time
    pub term: u64,
    /// Offset of the record header in the arena
    pub offset: i64,
    /// Payload length in bytes
    pub value_size: i32,
    /// Unix seconds the entry was allocated
    pub timestamp: i64,
    /// Per-item TTL in seconds; 0 = none
    pub ttl: u32,
    /// Opaque client flags
    pub flags: u32,
    /// IEEE CRC32 of the payload; 0 = unchecked
    pub crc32: u32,
}

impl IndexEntry {
    /// Bytes this entry consumes, index record and arena framing included
    #[must_use]
    pub fn total_size(&self) -> i64 {
        let encoded = serde_json::to_vec(self).map_or(0, |b| b.len() as i64);
        encoded + RECORD_HEADER_SIZE + i64::from(self.value_size)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        serde_json::from_slice(buf).map_err(ix)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(ix)
    }
}

/// Circular allocation state of one shard's arena
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Arena size this index was last reconciled against
    pub data_size: i64,
    /// Next free offset in the arena
    pub head: i64,
    /// Number of times the head has wrapped
    pub term: u64,
}

impl IndexMeta {
    /// Whether `entry` still points at bytes the head has not reclaimed.
    ///
    /// Entries from the current term live below the head; entries from the
    /// previous term survive only while they sit at or above it. Anything
    /// else is dead, including entries that no longer fit the arena.
    #[must_use]
    pub fn is_valid(&self, entry: &IndexEntry) -> bool {
        if entry.term > self.term {
            return false;
        }
        let end = entry.offset + i64::from(entry.value_size);
        if entry.term == self.term {
            return entry.offset < self.head && end <= self.data_size;
        }
        if entry.term + 1 != self.term {
            return false;
        }
        self.head <= entry.offset && end <= self.data_size
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        serde_json::from_slice(buf).map_err(ix)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(ix)
    }
}

/// Persistent key → [`IndexEntry`] map plus the shard's [`IndexMeta`]
pub struct IndexStore {
    db: Database,
    meta: RwLock<IndexMeta>,
}

impl IndexStore {
    /// Open or create the index at `path` for an arena of `data_size` bytes.
    ///
    /// If the arena size changed since the last run the meta is adjusted: a
    /// head beyond the new size resets to 0 and burns a term, so every entry
    /// allocated against the old layout fails validation.
    pub fn open(path: impl AsRef<Path>, data_size: i64) -> Result<Self> {
        let db = Database::create(path).map_err(ix)?;

        let mut meta = IndexMeta::default();
        let mut wtx = db.begin_write().map_err(ix)?;
        wtx.set_durability(Durability::None);
        {
            let meta_table = wtx.open_table(META_TABLE).map_err(ix)?;
            if let Some(v) = meta_table.get(META_KEY).map_err(ix)? {
                meta = IndexMeta::decode(v.value())?;
            }
            wtx.open_table(DATA_TABLE).map_err(ix)?;
        }
        wtx.commit().map_err(ix)?;

        if meta.data_size != data_size {
            meta.data_size = data_size;
        }
        if meta.head > data_size {
            meta.head = 0;
            meta.term += 1;
        }

        Ok(Self {
            db,
            meta: RwLock::new(meta),
        })
    }

    /// Snapshot of the allocation state
    #[must_use]
    pub fn metadata(&self) -> IndexMeta {
        *self.meta.read()
    }

    /// Look up `key`. Entries that fail validation are reported as missing
    /// but left in place; removing them is the scanner's job.
    pub fn get(&self, key: &str) -> Result<IndexEntry> {
        let rtx = self.db.begin_read().map_err(ix)?;
        let table = rtx.open_table(DATA_TABLE).map_err(ix)?;
        let entry = match table.get(key).map_err(ix)? {
            Some(v) => IndexEntry::decode(v.value())?,
            None => return Err(Error::NotFound),
        };
        if self.metadata().is_valid(&entry) {
            Ok(entry)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Allocate arena space for a value of `value_size` bytes.
    ///
    /// Advances the head (wrapping and bumping the term when the record
    /// would not fit) and persists the meta before returning, so the
    /// on-disk allocation state never lags a handed-out reservation.
    pub fn reserve(&self, value_size: i32) -> Result<IndexEntry> {
        let mut meta = self.meta.write();
        if i64::from(value_size) > meta.data_size {
            return Err(Error::NoSpace {
                need: i64::from(value_size),
                data_size: meta.data_size,
            });
        }
        if meta.head + RECORD_HEADER_SIZE + i64::from(value_size) > meta.data_size {
            meta.head = 0;
            meta.term += 1;
        }
        let entry = IndexEntry {
            term: meta.term,
            offset: meta.head,
            value_size,
            timestamp: unix_now(),
            ..Default::default()
        };
        meta.head += RECORD_HEADER_SIZE + i64::from(value_size);

        let mut wtx = self.db.begin_write().map_err(ix)?;
        wtx.set_durability(Durability::None);
        {
            let mut table = wtx.open_table(META_TABLE).map_err(ix)?;
            table
                .insert(META_KEY, meta.encode()?.as_slice())
                .map_err(ix)?;
        }
        wtx.commit().map_err(ix)?;
        Ok(entry)
    }

    /// Store `entry` under `key`, replacing any previous entry
    pub fn put(&self, key: &str, entry: &IndexEntry) -> Result<()> {
        let mut wtx = self.db.begin_write().map_err(ix)?;
        wtx.set_durability(Durability::None);
        {
            let mut table = wtx.open_table(DATA_TABLE).map_err(ix)?;
            table.insert(key, entry.encode()?.as_slice()).map_err(ix)?;
        }
        wtx.commit().map_err(ix)?;
        Ok(())
    }

    /// Delete `key` if present
    pub fn del(&self, key: &str) -> Result<()> {
        let mut wtx = self.db.begin_write().map_err(ix)?;
        wtx.set_durability(Durability::None);
        {
            let mut table = wtx.open_table(DATA_TABLE).map_err(ix)?;
            table.remove(key).map_err(ix)?;
        }
        wtx.commit().map_err(ix)?;
        Ok(())
    }

    /// Delete a batch of keys in one transaction
    pub fn del_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut wtx = self.db.begin_write().map_err(ix)?;
        wtx.set_durability(Durability::None);
        {
            let mut table = wtx.open_table(DATA_TABLE).map_err(ix)?;
            for key in keys {
                table.remove(key.as_str()).map_err(ix)?;
            }
        }
        wtx.commit().map_err(ix)?;
        Ok(())
    }

    /// Visit up to `max` entries in key order, starting strictly after
    /// `last_key` (from the beginning when `last_key` is empty). Stops early
    /// if `f` fails.
    pub fn iter<F>(&self, last_key: &str, max: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&str, IndexEntry) -> Result<()>,
    {
        let rtx = self.db.begin_read().map_err(ix)?;
        let table = rtx.open_table(DATA_TABLE).map_err(ix)?;
        let mut remaining = max;
        for item in table.range(last_key..).map_err(ix)? {
            let (k, v) = item.map_err(ix)?;
            let key = k.value();
            if key == last_key {
                continue;
            }
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            let entry = IndexEntry::decode(v.value())?;
            f(key, entry)?;
        }
        Ok(())
    }

    /// Total number of keys stored, dead entries included
    pub fn key_count(&self) -> Result<u64> {
        let rtx = self.db.begin_read().map_err(ix)?;
        let table = rtx.open_table(DATA_TABLE).map_err(ix)?;
        table.len().map_err(ix)
    }
}
