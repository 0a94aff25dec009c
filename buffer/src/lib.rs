//! Share segmented byte streams without copying.
//!
//! A [Buffer] is an ordered sequence of [Segment] references. Segments are fixed-capacity
//! chunks of bytes that are reference counted and immutable once shared, so a [Buffer] can
//! be cloned, split, and passed between threads by bumping reference counts instead of
//! copying bytes. Chunk storage is recycled through a process-wide [pool].
//!
//! # Example
//!
//! ```
//! use wanproxy_buffer::Buffer;
//!
//! let mut request = Buffer::from("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
//! let end = request.find(b'\n').unwrap();
//!
//! let mut line = Buffer::new();
//! request.moveout_into(&mut line, end + 1);
//! assert_eq!(line, "GET / HTTP/1.1\r\n");
//! assert!(request.prefix(b"Host:"));
//! ```

mod buffer;
pub use buffer::{Buffer, IOV_MAX};
pub mod endian;
pub mod hash;
pub mod pool;
pub use pool::SEGMENT_SIZE;
mod segment;
pub use segment::Segment;
