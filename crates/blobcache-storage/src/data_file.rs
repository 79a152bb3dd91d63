//! Fixed-size data arena
//!
//! A shard's values live in one preallocated file written as framed records
//! at offsets handed out by the index. Each record carries a 16-byte header
//! (magic + payload length, both big-endian) so a stale or wrapped-over
//! region can never be misread as a live value, whatever the index claims.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use blobcache_common::{Error, Result, MAX_VALUE_SIZE};
use parking_lot::RwLock;

/// Magic number identifying a record header
pub const RECORD_MAGIC: u64 = 20_126_241_245_322;

/// Record header size in bytes: magic (8) + payload length (8)
pub const RECORD_HEADER_SIZE: i64 = 16;

/// Record header preceding every payload in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RecordHeader {
    magic: u64,
    size: u64,
}

impl RecordHeader {
    fn to_bytes(self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        buf[..8].copy_from_slice(&self.magic.to_be_bytes());
        buf[8..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE as usize]) -> Self {
        Self {
            magic: u64::from_be_bytes(buf[..8].try_into().unwrap()),
            size: u64::from_be_bytes(buf[8..].try_into().unwrap()),
        }
    }
}

/// A fixed-size byte arena backed by a file.
///
/// All access is positioned I/O; reads run concurrently with each other and
/// are excluded only by writes. Offsets are handed out by the caller, the
/// arena itself keeps no allocation state.
pub struct DataFile {
    file: File,
    path: PathBuf,
    size: i64,
    lock: RwLock<()>,
}

impl DataFile {
    /// Open or create the arena at `path` and fix its length to `size`
    pub fn open(path: impl AsRef<Path>, size: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        Ok(Self {
            file,
            path,
            size,
            lock: RwLock::new(()),
        })
    }

    /// Arena size in bytes
    #[must_use]
    pub fn size(&self) -> i64 {
        self.size
    }

    /// The backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record at `offset` into `buf`.
    ///
    /// `buf.len()` must equal the payload length recorded in the header;
    /// a mismatch (or a bad magic) is a [`Error::Header`], any access past
    /// the arena end is [`Error::OutOfRange`].
    pub fn read(&self, offset: i64, buf: &mut [u8]) -> Result<()> {
        let _shared = self.lock.read();

        if offset < 0 || offset + RECORD_HEADER_SIZE > self.size {
            return Err(Error::OutOfRange);
        }
        let mut hdr_buf = [0u8; RECORD_HEADER_SIZE as usize];
        self.file.read_exact_at(&mut hdr_buf, offset as u64)?;
        let hdr = RecordHeader::from_bytes(&hdr_buf);
        if hdr.magic != RECORD_MAGIC
            || hdr.size != buf.len() as u64
            || hdr.size > MAX_VALUE_SIZE as u64
        {
            return Err(Error::Header { offset });
        }

        let data_offset = offset + RECORD_HEADER_SIZE;
        if data_offset + buf.len() as i64 > self.size {
            return Err(Error::OutOfRange);
        }
        self.file.read_exact_at(buf, data_offset as u64)?;
        Ok(())
    }

    /// Write a record (header + payload) at `offset`
    pub fn write(&self, offset: i64, data: &[u8]) -> Result<()> {
        let _exclusive = self.lock.write();

        if offset < 0 || offset + RECORD_HEADER_SIZE + data.len() as i64 > self.size {
            return Err(Error::OutOfRange);
        }
        let hdr = RecordHeader {
            magic: RECORD_MAGIC,
            size: data.len() as u64,
        };
        self.file.write_all_at(&hdr.to_bytes(), offset as u64)?;
        self.file
            .write_all_at(data, (offset + RECORD_HEADER_SIZE) as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(dir.path().join("data"), 1024).unwrap();
        assert_eq!(data.size(), 1024);

        let mut payload = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut payload);
        data.write(1000, &payload).unwrap();

        let mut out = [0u8; 8];
        data.read(1000, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(dir.path().join("data"), 1024).unwrap();

        let mut out = [0u8; 8];
        assert!(matches!(data.read(1024, &mut out), Err(Error::OutOfRange)));
        assert!(matches!(data.read(1023, &mut out), Err(Error::OutOfRange)));
    }

    #[test]
    fn test_write_out_of_range() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(dir.path().join("data"), 1024).unwrap();

        // 1017 + 16 + 8 > 1024
        assert!(matches!(
            data.write(1017, &[0u8; 8]),
            Err(Error::OutOfRange)
        ));
    }

    #[test]
    fn test_length_mismatch_is_header_error() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(dir.path().join("data"), 1024).unwrap();

        data.write(0, b"hello").unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(
            data.read(0, &mut out),
            Err(Error::Header { offset: 0 })
        ));
    }

    #[test]
    fn test_unwritten_region_is_header_error() {
        let dir = tempdir().unwrap();
        let data = DataFile::open(dir.path().join("data"), 1024).unwrap();

        let mut out = [0u8; 8];
        assert!(matches!(data.read(0, &mut out), Err(Error::Header { .. })));
    }

    #[test]
    fn test_record_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let data = DataFile::open(&path, 4096).unwrap();
            data.write(128, b"persistent").unwrap();
        }
        let data = DataFile::open(&path, 4096).unwrap();
        let mut out = [0u8; 10];
        data.read(128, &mut out).unwrap();
        assert_eq!(&out, b"persistent");
    }
}
