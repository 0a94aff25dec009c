//! Move [wanproxy_buffer::Buffer]s between channels through asynchronous pipes.
//!
//! A [Pipe] is a single-input, single-output transform stage. Most pipes are a
//! [PipeProducer] around a [Consumer] (or a [PipeSimple] around a [Process]). A [Splice]
//! pumps a source [StreamChannel] through a [Pipe] into a sink [StreamChannel] until end of
//! stream, and a [SplicePair] runs one [Splice] in each direction of a proxied connection.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use wanproxy_buffer::Buffer;
//! use wanproxy_event::{CallbackQueue, Event, Lock, Scheduler};
//! use wanproxy_io::{mocks, Splice, StreamChannel};
//!
//! let queue = CallbackQueue::new();
//! let scheduler: Arc<dyn Scheduler> = Arc::new(queue.clone());
//! let recorder = mocks::Recorder::new();
//! let lock = Lock::new("example");
//!
//! // client <-> (proxy_in -> proxy_out) <-> server
//! let (client, proxy_in) = mocks::pair();
//! let (proxy_out, server) = mocks::pair();
//! let _splice = Splice::new(proxy_in, None, proxy_out)
//!     .start(recorder.callback(&scheduler, lock.clone()));
//!
//! let _write = client.write(Buffer::from("ping"), recorder.callback(&scheduler, lock.clone()));
//! let _shutdown = client.shutdown(false, true, recorder.callback(&scheduler, lock));
//! queue.drain();
//!
//! assert_eq!(recorder.take().last(), Some(&Event::eos()));
//! assert_eq!(server.buffered(), 4);
//! ```

mod channel;
pub use channel::{BlockChannel, Channel, StreamChannel};
mod link;
pub use link::PipeLink;
pub mod mocks;
mod pair;
pub use pair::SplicePair;
mod pipe;
pub use pipe::Pipe;
mod producer;
pub use producer::{Consumer, PipeProducer, Producer};
mod simple;
pub use simple::{PipeNull, PipeSimple, PipeSink, Process};
mod splice;
pub use splice::Splice;
