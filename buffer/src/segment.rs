//! Fixed-capacity, reference-counted chunks of bytes.

use crate::pool::{self, SEGMENT_SIZE};
use std::{fmt, sync::Arc};

/// Backing storage shared by every [Segment] view of it.
struct Chunk {
    data: Box<[u8]>,
}

impl Chunk {
    /// Allocate a chunk holding at least `capacity` bytes.
    ///
    /// Chunks of up to [SEGMENT_SIZE] bytes come from the pool. Larger ones are only made
    /// when a single segment outgrows a pooled chunk, and are freed rather than cached.
    fn with_capacity(capacity: usize) -> Self {
        let data = if capacity <= SEGMENT_SIZE {
            pool::global().take()
        } else {
            vec![0u8; capacity].into_boxed_slice()
        };
        Self { data }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        pool::global().give(std::mem::take(&mut self.data));
    }
}

/// A view of `[offset, offset + length)` within a chunk of (usually) [SEGMENT_SIZE] bytes.
///
/// Cloning a [Segment] takes another reference to the same chunk (no bytes are copied) and
/// dropping it releases that reference. The bytes of a chunk are immutable while more than
/// one reference exists: in-place writes happen only through a uniquely held segment, so a
/// segment that has been shared (with another [crate::Buffer] or by [Segment::split_off])
/// is copied before it is written to.
///
/// Advancing the head ([Segment::skip]) or the tail ([Segment::trim]) only changes the view
/// and is permitted on shared segments.
pub struct Segment {
    chunk: Arc<Chunk>,
    offset: usize,
    length: usize,
}

impl Segment {
    /// Create an empty, uniquely held segment.
    pub fn new() -> Self {
        Self::with_capacity(SEGMENT_SIZE)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            chunk: Arc::new(Chunk::with_capacity(capacity)),
            offset: 0,
            length: 0,
        }
    }

    /// Create a uniquely held segment containing a copy of `data`.
    ///
    /// Data larger than [SEGMENT_SIZE] gets a chunk of its own size.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut segment = Self::with_capacity(data.len());
        segment.extend(data);
        segment
    }

    /// Returns the number of bytes in view.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the segment holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the spare capacity after the last byte in view.
    pub fn avail(&self) -> usize {
        self.capacity() - self.offset - self.length
    }

    fn capacity(&self) -> usize {
        self.chunk.data.len()
    }

    /// Returns `true` if no other segment references the same chunk.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.chunk) == 1
    }

    /// Returns the number of segments referencing the same chunk.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.chunk)
    }

    /// Returns the bytes in view.
    pub fn as_slice(&self) -> &[u8] {
        &self.chunk.data[self.offset..self.offset + self.length]
    }

    /// Append `data` and return the resulting segment.
    ///
    /// When this segment is uniquely held and has room after its tail, the bytes are
    /// written in place and the same segment is returned. Otherwise the content is first
    /// compacted or copied into a fresh chunk, which is larger than [SEGMENT_SIZE] when the
    /// combined length requires it. Callers must always continue with the returned segment.
    pub fn append(self, data: &[u8]) -> Segment {
        if data.is_empty() {
            return self;
        }
        let needed = self.length + data.len();
        let mut segment = if self.is_unique() && self.avail() >= data.len() {
            self
        } else if self.is_unique() && self.capacity() >= needed {
            self.pullup()
        } else {
            let mut fresh = Segment::with_capacity(needed);
            fresh.extend(self.as_slice());
            fresh
        };
        let written = segment.extend(data);
        debug_assert_eq!(written, data.len());
        segment
    }

    /// Drop `n` bytes from the head of the view.
    ///
    /// Returns `None` when nothing remains, signalling that the segment should be removed
    /// from its owner.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [Segment::len].
    pub fn skip(mut self, n: usize) -> Option<Segment> {
        assert!(
            n <= self.length,
            "skip past end of segment: {} > {}",
            n,
            self.length
        );
        self.offset += n;
        self.length -= n;
        if self.length == 0 {
            return None;
        }
        Some(self)
    }

    /// Drop `n` bytes from the tail of the view.
    ///
    /// Returns `None` when nothing remains.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [Segment::len].
    pub fn trim(mut self, n: usize) -> Option<Segment> {
        assert!(
            n <= self.length,
            "trim past start of segment: {} > {}",
            n,
            self.length
        );
        self.length -= n;
        if self.length == 0 {
            return None;
        }
        Some(self)
    }

    /// Split the view at `at`, returning `[at, len)` and keeping `[0, at)`.
    ///
    /// Both halves reference the same chunk, so neither can be extended in place afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `at` exceeds [Segment::len].
    pub fn split_off(&mut self, at: usize) -> Segment {
        assert!(
            at <= self.length,
            "split past end of segment: {} > {}",
            at,
            self.length
        );
        let tail = Segment {
            chunk: self.chunk.clone(),
            offset: self.offset + at,
            length: self.length - at,
        };
        self.length = at;
        tail
    }

    /// Return a uniquely held segment whose view starts at the beginning of its chunk.
    ///
    /// A uniquely held segment is compacted in place; a shared one is copied.
    pub fn pullup(mut self) -> Segment {
        if !self.is_unique() {
            let mut fresh = Segment::with_capacity(self.length);
            fresh.extend(self.as_slice());
            return fresh;
        }
        if self.offset > 0 {
            let range = self.offset..self.offset + self.length;
            self.chunk_mut().copy_within(range, 0);
            self.offset = 0;
        }
        self
    }

    /// Append as much of `data` as fits after the tail of a uniquely held segment.
    ///
    /// Returns the number of bytes written (zero when the segment is shared or full).
    pub(crate) fn extend(&mut self, data: &[u8]) -> usize {
        if !self.is_unique() {
            return 0;
        }
        let n = data.len().min(self.avail());
        if n == 0 {
            return 0;
        }
        let tail = self.offset + self.length;
        self.chunk_mut()[tail..tail + n].copy_from_slice(&data[..n]);
        self.length += n;
        n
    }

    fn chunk_mut(&mut self) -> &mut [u8] {
        &mut Arc::get_mut(&mut self.chunk)
            .expect("mutable access requires a unique segment")
            .data
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Segment {
    fn clone(&self) -> Self {
        Self {
            chunk: self.chunk.clone(),
            offset: self.offset,
            length: self.length,
        }
    }
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty_and_unique() {
        let segment = Segment::new();
        assert!(segment.is_empty());
        assert!(segment.is_unique());
        assert_eq!(segment.avail(), SEGMENT_SIZE);
    }

    #[test]
    fn test_append_in_place() {
        let segment = Segment::from_slice(b"hello");
        let ptr = segment.as_slice().as_ptr();
        let segment = segment.append(b", world");
        assert_eq!(segment.as_slice(), b"hello, world");
        assert_eq!(segment.as_slice().as_ptr(), ptr);
    }

    #[test]
    fn test_append_to_shared_copies() {
        let original = Segment::from_slice(b"abc");
        let shared = original.clone();
        assert_eq!(original.ref_count(), 2);

        let appended = shared.append(b"def");
        assert_eq!(appended.as_slice(), b"abcdef");
        assert_eq!(original.as_slice(), b"abc");
        assert!(original.is_unique());
        assert!(appended.is_unique());
    }

    #[test]
    fn test_append_forces_reallocation() {
        let data: Vec<u8> = (0..64).collect();
        let fill = vec![b'A'; SEGMENT_SIZE - data.len()];
        let segment = Segment::from_slice(&fill);
        let keep = segment.clone();

        let appended = segment.append(&data);
        assert_eq!(appended.len(), SEGMENT_SIZE);
        assert!(appended.as_slice()[..fill.len()].iter().all(|b| *b == b'A'));
        assert_eq!(&appended.as_slice()[fill.len()..], &data[..]);
        assert_eq!(keep.as_slice(), &fill[..]);
    }

    #[test]
    fn test_append_after_skip_compacts() {
        let fill = vec![b'x'; SEGMENT_SIZE];
        let segment = Segment::from_slice(&fill).skip(10).unwrap();
        assert_eq!(segment.avail(), 0);

        let segment = segment.append(b"0123456789");
        assert_eq!(segment.len(), SEGMENT_SIZE);
        assert_eq!(&segment.as_slice()[SEGMENT_SIZE - 10..], b"0123456789");
    }

    #[test]
    fn test_append_to_full_segment_grows() {
        let full = Segment::from_slice(&[b'A'; SEGMENT_SIZE]);
        assert_eq!(full.avail(), 0);
        let ptr = full.as_slice().as_ptr();

        let data: Vec<u8> = (0..100).collect();
        let grown = full.append(&data);
        assert_eq!(grown.len(), SEGMENT_SIZE + data.len());
        assert_ne!(grown.as_slice().as_ptr(), ptr);
        assert!(grown.as_slice()[..SEGMENT_SIZE].iter().all(|b| *b == b'A'));
        assert_eq!(&grown.as_slice()[SEGMENT_SIZE..], &data[..]);
        assert!(grown.is_unique());
    }

    #[test]
    fn test_append_to_full_shared_segment_grows() {
        let full = Segment::from_slice(&[b'A'; SEGMENT_SIZE]);
        let keep = full.clone();

        let grown = full.append(b"x");
        assert_eq!(grown.len(), SEGMENT_SIZE + 1);
        assert_eq!(grown.as_slice()[SEGMENT_SIZE], b'x');
        assert_eq!(keep.len(), SEGMENT_SIZE);
        assert!(keep.is_unique());
    }

    #[test]
    fn test_from_large_slice() {
        let data = vec![3u8; SEGMENT_SIZE * 2 + 5];
        let segment = Segment::from_slice(&data);
        assert_eq!(segment.as_slice(), &data[..]);
        assert_eq!(segment.avail(), 0);
    }

    #[test]
    fn test_skip_and_trim() {
        let segment = Segment::from_slice(b"abcdef");
        let segment = segment.skip(2).unwrap();
        assert_eq!(segment.as_slice(), b"cdef");
        let segment = segment.trim(1).unwrap();
        assert_eq!(segment.as_slice(), b"cde");
        assert!(segment.clone().skip(3).is_none());
        assert!(segment.trim(3).is_none());
    }

    #[test]
    #[should_panic(expected = "skip past end of segment")]
    fn test_skip_too_far() {
        Segment::from_slice(b"ab").skip(3);
    }

    #[test]
    fn test_split_off_shares_chunk() {
        let mut head = Segment::from_slice(b"hello world");
        let tail = head.split_off(5);
        assert_eq!(head.as_slice(), b"hello");
        assert_eq!(tail.as_slice(), b" world");
        assert_eq!(head.ref_count(), 2);

        // The head must not overwrite bytes visible through the tail
        let head = head.append(b"!!!");
        assert_eq!(head.as_slice(), b"hello!!!");
        assert_eq!(tail.as_slice(), b" world");
    }

    #[test]
    fn test_pullup_unique_moves_in_place() {
        let segment = Segment::from_slice(b"..data").skip(2).unwrap();
        let segment = segment.pullup();
        assert_eq!(segment.as_slice(), b"data");
        assert_eq!(segment.avail(), SEGMENT_SIZE - 4);
    }

    #[test]
    fn test_pullup_shared_copies() {
        let segment = Segment::from_slice(b"shared");
        let other = segment.clone();
        let pulled = segment.pullup();
        assert!(pulled.is_unique());
        assert!(other.is_unique());
        assert_eq!(pulled.as_slice(), other.as_slice());
    }
}
