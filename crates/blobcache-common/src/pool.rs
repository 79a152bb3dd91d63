//! Size-classed buffer pool
//!
//! Read responses hand the client a value buffer that lives only for the
//! duration of one response write, so the server would otherwise allocate and
//! drop a large buffer per get. The pool keeps freed buffers on power-of-two
//! shelves and reuses them for later allocations of the same class.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

/// Smallest shelf capacity (4 KiB)
const SHELF_MIN: usize = 4096;

/// Number of shelves: 4 KiB, 8 KiB, ... up to 128 MiB
const SHELF_COUNT: usize = 16;

/// Buffers kept per shelf; beyond this, freed buffers are dropped
const SHELF_DEPTH: usize = 64;

/// Byte-buffer allocator used for value buffers.
///
/// `alloc` returns a zero-filled buffer of exactly `n` bytes; `free` hands it
/// back for reuse. Freeing is optional: a buffer that never comes back is
/// simply lost to the pool, not leaked.
pub trait Allocator: Send + Sync {
    fn alloc(&self, n: usize) -> Vec<u8>;
    fn free(&self, buf: Vec<u8>);
}

/// Counter snapshot of a [`BufferPool`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Number of alloc calls
    pub allocs: i64,
    /// Number of free calls
    pub frees: i64,
    /// Number of allocations that could not be served from a shelf
    pub fresh: i64,
}

/// Size-classed free-list allocator
pub struct BufferPool {
    shelves: Vec<Mutex<Vec<Vec<u8>>>>,
    allocs: AtomicI64,
    frees: AtomicI64,
    fresh: AtomicI64,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shelves: (0..SHELF_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            allocs: AtomicI64::new(0),
            frees: AtomicI64::new(0),
            fresh: AtomicI64::new(0),
        }
    }

    /// Get the pool counters
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
        }
    }

    /// Shelf that serves allocations of `n` bytes
    fn alloc_shelf(n: usize) -> Option<usize> {
        let cap = n.max(SHELF_MIN).next_power_of_two();
        let idx = (cap.trailing_zeros() - SHELF_MIN.trailing_zeros()) as usize;
        (idx < SHELF_COUNT).then_some(idx)
    }

    /// Shelf a buffer of capacity `cap` belongs on
    fn free_shelf(cap: usize) -> Option<usize> {
        if cap < SHELF_MIN {
            return None;
        }
        let idx = (cap.ilog2() - SHELF_MIN.trailing_zeros()) as usize;
        (idx < SHELF_COUNT).then_some(idx)
    }

    /// Capacity of shelf `idx`
    fn shelf_cap(idx: usize) -> usize {
        SHELF_MIN << idx
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for BufferPool {
    fn alloc(&self, n: usize) -> Vec<u8> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = Self::alloc_shelf(n) {
            if let Some(mut buf) = self.shelves[idx].lock().pop() {
                buf.clear();
                buf.resize(n, 0);
                return buf;
            }
            self.fresh.fetch_add(1, Ordering::Relaxed);
            let mut buf = Vec::with_capacity(Self::shelf_cap(idx));
            buf.resize(n, 0);
            return buf;
        }
        // oversized request, served outside the shelves
        self.fresh.fetch_add(1, Ordering::Relaxed);
        vec![0; n]
    }

    fn free(&self, buf: Vec<u8>) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = Self::free_shelf(buf.capacity()) {
            let mut shelf = self.shelves[idx].lock();
            if shelf.len() < SHELF_DEPTH {
                shelf.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_reuses_freed_buffer() {
        let pool = BufferPool::new();

        let buf = pool.alloc(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0));
        pool.free(buf);

        let buf = pool.alloc(200);
        assert_eq!(buf.len(), 200);
        pool.free(buf);

        let m = pool.metrics();
        assert_eq!(m.allocs, 2);
        assert_eq!(m.frees, 2);
        // second alloc came off the 4 KiB shelf
        assert_eq!(m.fresh, 1);
    }

    #[test]
    fn test_alloc_new_class_is_fresh() {
        let pool = BufferPool::new();

        let small = pool.alloc(10);
        pool.free(small);
        let big = pool.alloc(SHELF_MIN + 1);
        assert_eq!(big.len(), SHELF_MIN + 1);
        assert_eq!(big.capacity(), SHELF_MIN * 2);
        pool.free(big);

        let m = pool.metrics();
        assert_eq!(m.allocs, 2);
        assert_eq!(m.fresh, 2);
    }

    #[test]
    fn test_undersized_free_is_dropped() {
        let pool = BufferPool::new();
        pool.free(vec![0u8; 16]);

        let buf = pool.alloc(16);
        let m = pool.metrics();
        assert_eq!(m.frees, 1);
        // the 16-byte buffer was not shelved, so the alloc was fresh
        assert_eq!(m.fresh, 1);
        pool.free(buf);
    }

    #[test]
    fn test_shelf_selection() {
        assert_eq!(BufferPool::alloc_shelf(0), Some(0));
        assert_eq!(BufferPool::alloc_shelf(4096), Some(0));
        assert_eq!(BufferPool::alloc_shelf(4097), Some(1));
        assert_eq!(BufferPool::alloc_shelf(128 << 20), Some(15));
        assert_eq!(BufferPool::alloc_shelf((128 << 20) + 1), None);

        assert_eq!(BufferPool::free_shelf(100), None);
        assert_eq!(BufferPool::free_shelf(8192), Some(1));
    }
}
