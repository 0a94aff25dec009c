//! Recycle segment storage to avoid allocator churn.
//!
//! Segments are backed by chunks of [SEGMENT_SIZE] bytes (a segment that outgrows one gets a
//! larger, uncached chunk). When the last reference to a pooled chunk is dropped, its
//! storage is returned to a process-wide freelist (bounded by [SEGMENT_CACHE_LIMIT])
//! instead of being freed. The next segment allocation pops from that freelist before
//! falling back to the heap.
//!
//! # Thread Safety
//!
//! The freelist is a lock-free [`crossbeam_queue::ArrayQueue`], so chunks may be released
//! on a different thread than the one that allocated them.

use crossbeam_queue::ArrayQueue;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    OnceLock,
};
use tracing::trace;

/// Capacity, in bytes, of every segment.
pub const SEGMENT_SIZE: usize = 2048;

/// Maximum number of idle chunks retained by the global pool.
pub const SEGMENT_CACHE_LIMIT: usize = 16384;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Number of idle chunks currently cached.
    pub cached: usize,
    /// Total chunks allocated from the heap.
    pub allocated: u64,
    /// Total chunks served from the cache.
    pub reused: u64,
    /// Total chunks freed because the cache was full.
    pub discarded: u64,
}

/// A bounded freelist of segment storage.
pub(crate) struct Pool {
    free: ArrayQueue<Box<[u8]>>,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl Pool {
    /// Create a pool that retains at most `limit` idle chunks.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    pub(crate) fn new(limit: usize) -> Self {
        assert!(limit > 0, "segment cache limit must be non-zero");
        Self {
            free: ArrayQueue::new(limit),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Take a chunk of [SEGMENT_SIZE] bytes, reusing a cached one when available.
    ///
    /// The contents of a reused chunk are unspecified.
    pub(crate) fn take(&self) -> Box<[u8]> {
        if let Some(storage) = self.free.pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return storage;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        vec![0u8; SEGMENT_SIZE].into_boxed_slice()
    }

    /// Return a chunk to the pool.
    ///
    /// Storage of the wrong size (e.g. the empty placeholder left behind after a chunk is
    /// released) is ignored.
    pub(crate) fn give(&self, storage: Box<[u8]>) {
        if storage.len() != SEGMENT_SIZE {
            return;
        }
        if self.free.push(storage).is_err() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Free all cached chunks.
    pub(crate) fn clear(&self) {
        let mut freed = 0;
        while self.free.pop().is_some() {
            freed += 1;
        }
        trace!(freed, "cleared segment pool");
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            cached: self.free.len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

static POOL: OnceLock<Pool> = OnceLock::new();

/// The process-wide pool used by [crate::Segment].
pub(crate) fn global() -> &'static Pool {
    POOL.get_or_init(|| Pool::new(SEGMENT_CACHE_LIMIT))
}

/// Returns a snapshot of the global pool.
pub fn stats() -> Stats {
    global().stats()
}

/// Free every chunk cached by the global pool.
///
/// Segments still in use are unaffected and return to the (now empty) cache when dropped.
pub fn clear() {
    global().clear()
}
