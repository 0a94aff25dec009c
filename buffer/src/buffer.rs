//! An ordered sequence of shared segments representing a logical byte stream.

use crate::{pool::SEGMENT_SIZE, Segment};
use bytes::{Buf, Bytes};
use std::{
    collections::{vec_deque, VecDeque},
    fmt,
    fmt::Write as _,
    io::IoSlice,
};

/// Maximum number of regions exposed to a single vectored I/O call.
pub const IOV_MAX: usize = 1024;

/// A logical byte stream stored as a sequence of [Segment] references.
///
/// A [Buffer] owns no bytes directly. Cloning one takes a reference to each of its segments
/// (O(segments), not O(bytes)), which is what makes it cheap to pass by value. Appending
/// extends the last segment in place only when that segment is uniquely held.
///
/// # Panics
///
/// Operations that would read or consume past the end of the buffer (e.g. [Buffer::skip],
/// [Buffer::copyout], [Buffer::moveout]) panic: the caller can always check
/// [Buffer::len] first, so violating these bounds is a bug in the caller.
#[derive(Clone, Default)]
pub struct Buffer {
    segments: VecDeque<Segment>,
    length: usize,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer containing a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.append_slice(data);
        buffer
    }

    /// Returns the number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of segments backing the buffer.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterate over the segments backing the buffer, in byte order.
    pub fn segments(&self) -> vec_deque::Iter<'_, Segment> {
        self.segments.iter()
    }

    /// Iterate over the contiguous byte regions of the buffer, in byte order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Drop all content.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.length = 0;
    }

    /// Append a single byte.
    pub fn append_byte(&mut self, byte: u8) {
        self.append_slice(&[byte]);
    }

    /// Append a copy of `data`.
    ///
    /// Fills the spare room of the last segment when it is uniquely held, then adds new
    /// segments as needed.
    pub fn append_slice(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.length += data.len();
        if let Some(last) = self.segments.back_mut() {
            let written = last.extend(data);
            data = &data[written..];
        }
        for chunk in data.chunks(SEGMENT_SIZE) {
            self.segments.push_back(Segment::from_slice(chunk));
        }
    }

    /// Append a segment by reference.
    ///
    /// Empty segments are dropped.
    pub fn append_segment(&mut self, segment: Segment) {
        if segment.is_empty() {
            return;
        }
        self.length += segment.len();
        self.segments.push_back(segment);
    }

    /// Append the content of `other` by taking a reference to each of its segments.
    ///
    /// Segments small enough to fit in the spare room of a uniquely held last segment are
    /// copied there instead, which keeps streams of tiny appends from fragmenting.
    pub fn append_buffer(&mut self, other: &Buffer) {
        for segment in other.segments.iter() {
            if let Some(last) = self.segments.back_mut() {
                if last.is_unique() && last.avail() >= segment.len() {
                    last.extend(segment.as_slice());
                    self.length += segment.len();
                    continue;
                }
            }
            self.append_segment(segment.clone());
        }
    }

    /// Move all content of `other` to the end of this buffer, leaving `other` empty.
    pub fn append(&mut self, other: &mut Buffer) {
        self.length += other.length;
        self.segments.append(&mut other.segments);
        other.length = 0;
    }

    /// Insert a copy of `data` at the front of the buffer.
    pub fn prepend_slice(&mut self, data: &[u8]) {
        self.length += data.len();
        for chunk in data.rchunks(SEGMENT_SIZE) {
            self.segments.push_front(Segment::from_slice(chunk));
        }
    }

    /// Insert the content of `other` at the front of this buffer by reference.
    pub fn prepend_buffer(&mut self, other: &Buffer) {
        self.length += other.length;
        for segment in other.segments.iter().rev() {
            self.segments.push_front(segment.clone());
        }
    }

    /// Returns the first byte, if any.
    pub fn peek(&self) -> Option<u8> {
        self.segments.front().map(|segment| segment.as_slice()[0])
    }

    /// Returns the byte at `offset`, if any.
    pub fn byte_at(&self, mut offset: usize) -> Option<u8> {
        for segment in self.segments.iter() {
            if offset < segment.len() {
                return Some(segment.as_slice()[offset]);
            }
            offset -= segment.len();
        }
        None
    }

    /// Drop the first `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [Buffer::len].
    pub fn skip(&mut self, n: usize) {
        assert!(
            n <= self.length,
            "skip past end of buffer: {} > {}",
            n,
            self.length
        );
        let mut remaining = n;
        while remaining > 0 {
            let Some(segment) = self.segments.pop_front() else {
                break;
            };
            let take = remaining.min(segment.len());
            remaining -= take;
            if let Some(rest) = segment.skip(take) {
                self.segments.push_front(rest);
            }
        }
        self.length -= n;
    }

    /// Drop the last `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [Buffer::len].
    pub fn trim(&mut self, n: usize) {
        assert!(
            n <= self.length,
            "trim past start of buffer: {} > {}",
            n,
            self.length
        );
        let mut remaining = n;
        while remaining > 0 {
            let Some(segment) = self.segments.pop_back() else {
                break;
            };
            let take = remaining.min(segment.len());
            remaining -= take;
            if let Some(rest) = segment.trim(take) {
                self.segments.push_back(rest);
            }
        }
        self.length -= n;
    }

    /// Shorten the buffer to `len` bytes. Has no effect if the buffer is already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len < self.length {
            self.trim(self.length - len);
        }
    }

    /// Split the buffer at `at`, returning `[at, len)` and keeping `[0, at)`.
    ///
    /// A segment straddling `at` is split into two views of the same chunk.
    ///
    /// # Panics
    ///
    /// Panics if `at` exceeds [Buffer::len].
    pub fn split_off(&mut self, at: usize) -> Buffer {
        assert!(
            at <= self.length,
            "split past end of buffer: {} > {}",
            at,
            self.length
        );
        let mut position = 0;
        let mut index = 0;
        while index < self.segments.len() && position + self.segments[index].len() <= at {
            position += self.segments[index].len();
            index += 1;
        }
        let mut tail = Buffer {
            segments: self.segments.split_off(index),
            length: self.length - position,
        };
        if position < at {
            if let Some(mut straddling) = tail.segments.pop_front() {
                let rest = straddling.split_off(at - position);
                tail.segments.push_front(rest);
                self.segments.push_back(straddling);
            }
        }
        tail.length = self.length - at;
        self.length = at;
        tail
    }

    /// Copy the first `dst.len()` bytes into `dst` without consuming them.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is longer than the buffer.
    pub fn copyout(&self, dst: &mut [u8]) {
        self.copyout_at(dst, 0);
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst` without consuming them.
    ///
    /// # Panics
    ///
    /// Panics if the requested range extends past the end of the buffer.
    pub fn copyout_at(&self, dst: &mut [u8], offset: usize) {
        assert!(
            offset + dst.len() <= self.length,
            "copyout past end of buffer: {} + {} > {}",
            offset,
            dst.len(),
            self.length
        );
        let mut skip = offset;
        let mut written = 0;
        for segment in self.segments.iter() {
            if written == dst.len() {
                break;
            }
            let data = segment.as_slice();
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let data = &data[skip..];
            skip = 0;
            let n = data.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&data[..n]);
            written += n;
        }
    }

    /// Copy the first `dst.len()` bytes into `dst` and remove them from the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is longer than the buffer.
    pub fn moveout(&mut self, dst: &mut [u8]) {
        self.copyout(dst);
        self.skip(dst.len());
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`, then remove everything up to
    /// the end of the copied range (the skipped `offset` bytes included).
    ///
    /// # Panics
    ///
    /// Panics if the requested range extends past the end of the buffer.
    pub fn moveout_at(&mut self, dst: &mut [u8], offset: usize) {
        self.copyout_at(dst, offset);
        self.skip(offset + dst.len());
    }

    /// Move the first `len` bytes to the end of `dst`.
    ///
    /// Whole segments are transferred by reference. A segment straddling `len` is split into
    /// two views of the same chunk, so no bytes are copied in either case.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [Buffer::len].
    pub fn moveout_into(&mut self, dst: &mut Buffer, len: usize) {
        assert!(
            len <= self.length,
            "moveout past end of buffer: {} > {}",
            len,
            self.length
        );
        let mut remaining = len;
        while remaining > 0 {
            let Some(mut segment) = self.segments.pop_front() else {
                break;
            };
            if segment.len() > remaining {
                let rest = segment.split_off(remaining);
                self.segments.push_front(rest);
            }
            remaining -= segment.len();
            dst.append_segment(segment);
        }
        self.length -= len;
    }

    /// Drop `offset` bytes, then move the following `len` bytes to the end of `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the requested range extends past the end of the buffer.
    pub fn moveout_into_at(&mut self, dst: &mut Buffer, offset: usize, len: usize) {
        assert!(
            offset + len <= self.length,
            "moveout past end of buffer: {} + {} > {}",
            offset,
            len,
            self.length
        );
        self.skip(offset);
        self.moveout_into(dst, len);
    }

    /// Remove `[offset, offset + len)` from the middle of the buffer.
    ///
    /// The removed bytes are appended to `extracted` when provided. Bytes before and after
    /// the range remain, in order.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of the buffer.
    pub fn cut(&mut self, offset: usize, len: usize, extracted: Option<&mut Buffer>) {
        assert!(
            offset + len <= self.length,
            "cut past end of buffer: {} + {} > {}",
            offset,
            len,
            self.length
        );
        let mut tail = self.split_off(offset);
        match extracted {
            Some(extracted) => tail.moveout_into(extracted, len),
            None => tail.skip(len),
        }
        self.append(&mut tail);
    }

    /// Returns `true` if the buffer begins with `data`.
    pub fn prefix(&self, data: &[u8]) -> bool {
        data.len() <= self.length && starts_with(self.chunks(), std::iter::once(data))
    }

    /// Returns `true` if the buffer begins with the content of `other`.
    pub fn prefix_buffer(&self, other: &Buffer) -> bool {
        other.length <= self.length && starts_with(self.chunks(), other.chunks())
    }

    /// Returns `true` if the buffer holds exactly `data`.
    pub fn equal(&self, data: &[u8]) -> bool {
        data.len() == self.length && self.prefix(data)
    }

    /// Returns `true` if the buffer holds exactly the content of `other`.
    pub fn equal_buffer(&self, other: &Buffer) -> bool {
        other.length == self.length && self.prefix_buffer(other)
    }

    /// Returns the offset of the first occurrence of `byte`.
    pub fn find(&self, byte: u8) -> Option<usize> {
        self.find_from(byte, 0)
    }

    /// Returns the offset of the first occurrence of `byte` at or after `start`.
    pub fn find_from(&self, byte: u8, start: usize) -> Option<usize> {
        let mut position = 0;
        for segment in self.segments.iter() {
            let data = segment.as_slice();
            if position + data.len() > start {
                let from = start.saturating_sub(position);
                if let Some(index) = data[from..].iter().position(|b| *b == byte) {
                    return Some(position + from + index);
                }
            }
            position += data.len();
        }
        None
    }

    /// Returns the offset and value of the first byte that is a member of `set`.
    pub fn find_any(&self, set: &[u8]) -> Option<(usize, u8)> {
        let mut position = 0;
        for segment in self.segments.iter() {
            let data = segment.as_slice();
            if let Some(index) = data.iter().position(|b| set.contains(b)) {
                return Some((position + index, data[index]));
            }
            position += data.len();
        }
        None
    }

    /// Split the buffer on every occurrence of `delim`.
    ///
    /// With `include_empty`, this behaves like splitting a byte string: `"/usr/src"` on `/`
    /// yields `["", "usr", "src"]` and `","` on `,` yields `["", ""]`. Without it, empty
    /// fields are dropped: `["usr", "src"]` and `[]` respectively. An empty buffer yields no
    /// fields either way.
    ///
    /// Fields reference the segments of this buffer; no bytes are copied.
    pub fn split(&self, delim: u8, include_empty: bool) -> Vec<Buffer> {
        let mut fields = Vec::new();
        if self.is_empty() {
            return fields;
        }
        let mut rest = self.clone();
        while let Some(position) = rest.find(delim) {
            if position > 0 || include_empty {
                let mut field = Buffer::new();
                rest.moveout_into(&mut field, position);
                fields.push(field);
            }
            rest.skip(1);
        }
        if !rest.is_empty() || include_empty {
            fields.push(rest);
        }
        fields
    }

    /// Concatenate `fields`, inserting `delim` strictly between consecutive fields.
    pub fn join(fields: &[Buffer], delim: &[u8]) -> Buffer {
        let mut joined = Buffer::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                joined.append_slice(delim);
            }
            joined.append_buffer(field);
        }
        joined
    }

    /// Render a canonical hex+ASCII dump (16 bytes per line) with offsets starting at
    /// `start`.
    ///
    /// Each line holds an 8-digit hex offset, two groups of eight hex bytes separated by an
    /// extra space, and the printable bytes between `|` delimiters. The dump ends with a
    /// line holding only the offset one past the last byte.
    pub fn hexdump(&self, start: usize) -> String {
        let mut out = String::new();
        let mut line = [0u8; 16];
        let mut filled = 0;
        let mut offset = start;
        for byte in self.chunks().flat_map(|chunk| chunk.iter().copied()) {
            line[filled] = byte;
            filled += 1;
            if filled == line.len() {
                hexdump_line(&mut out, offset, &line);
                offset += filled;
                filled = 0;
            }
        }
        if filled > 0 {
            hexdump_line(&mut out, offset, &line[..filled]);
            offset += filled;
        }
        let _ = writeln!(out, "{offset:08x}");
        out
    }

    /// Expose up to `iov.len()` segments (capped at [IOV_MAX]) for vectored I/O without
    /// consuming them.
    ///
    /// Returns the number of entries filled.
    pub fn fill_iovec<'a>(&'a self, iov: &mut [IoSlice<'a>]) -> usize {
        let max = iov.len().min(IOV_MAX);
        let mut count = 0;
        for (slot, chunk) in iov[..max].iter_mut().zip(self.chunks()) {
            *slot = IoSlice::new(chunk);
            count += 1;
        }
        count
    }

    /// Copy the content into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Returns `true` if the bytes produced by `haystack` begin with the bytes produced by
/// `needle`, regardless of how either is fragmented.
fn starts_with<'a, 'b>(
    mut haystack: impl Iterator<Item = &'a [u8]>,
    mut needle: impl Iterator<Item = &'b [u8]>,
) -> bool {
    let mut h: &[u8] = &[];
    let mut n: &[u8] = &[];
    loop {
        if n.is_empty() {
            match needle.next() {
                Some(chunk) => {
                    n = chunk;
                    continue;
                }
                None => return true,
            }
        }
        if h.is_empty() {
            match haystack.next() {
                Some(chunk) => {
                    h = chunk;
                    continue;
                }
                None => return false,
            }
        }
        let k = h.len().min(n.len());
        if h[..k] != n[..k] {
            return false;
        }
        h = &h[k..];
        n = &n[k..];
    }
}

fn hexdump_line(out: &mut String, offset: usize, bytes: &[u8]) {
    let _ = write!(out, "{offset:08x}  ");
    for i in 0..16 {
        match bytes.get(i) {
            Some(byte) => {
                let _ = write!(out, "{byte:02x} ");
            }
            None => out.push_str("   "),
        }
        if i == 7 {
            out.push(' ');
        }
    }
    out.push_str(" |");
    for byte in bytes {
        if byte.is_ascii_graphic() || *byte == b' ' {
            out.push(*byte as char);
        } else {
            out.push('.');
        }
    }
    out.push_str("|\n");
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("length", &self.length)
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.equal_buffer(other)
    }
}

impl Eq for Buffer {}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.equal(other)
    }
}

impl PartialEq<&[u8]> for Buffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self.equal(other)
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for Buffer {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.equal(&other[..])
    }
}

impl PartialEq<str> for Buffer {
    fn eq(&self, other: &str) -> bool {
        self.equal(other.as_bytes())
    }
}

impl PartialEq<&str> for Buffer {
    fn eq(&self, other: &&str) -> bool {
        self.equal(other.as_bytes())
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self {
        Self::from_slice(data.as_bytes())
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_slice(&data)
    }
}

impl From<String> for Buffer {
    fn from(data: String) -> Self {
        Self::from_slice(data.as_bytes())
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self::from_slice(&data)
    }
}

impl From<Segment> for Buffer {
    fn from(segment: Segment) -> Self {
        let mut buffer = Self::new();
        buffer.append_segment(segment);
        buffer
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.length
    }

    fn chunk(&self) -> &[u8] {
        self.segments
            .front()
            .map(Segment::as_slice)
            .unwrap_or_default()
    }

    fn advance(&mut self, cnt: usize) {
        self.skip(cnt);
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        self.fill_iovec(dst)
    }
}
