//! Drive one-shot callbacks from timers, readiness, and worker threads.
//!
//! Work is expressed as [Callback]s: one-shot closures bound to a [Scheduler] and guarded
//! by a [Lock]. Scheduling a callback (or starting any operation that will eventually
//! schedule one) returns an [Action]. The [Action] is the only way to release the
//! operation: cancelling it (or simply dropping it) before the callback runs guarantees the
//! callback never runs, and cancelling it afterwards is a no-op.
//!
//! An [EventSystem] composes the threads that drive callbacks:
//!
//! - a default [CallbackThread] (plus an optional [WorkerPool]) that runs callbacks in FIFO
//!   order, skipping callbacks whose lock is held elsewhere,
//! - a [TimeoutThread] that hands callbacks to the default thread once their deadline passes,
//! - an `EventPoll` (unix) that reports file descriptor readiness,
//! - a [DestroyThread] that drops objects only after acquiring their lock.
//!
//! # Example
//!
//! ```
//! use std::{sync::mpsc, time::Duration};
//! use wanproxy_event::{Config, Event, EventSystem, Lock};
//!
//! let system = EventSystem::new(Config::default()).unwrap();
//! system.start().unwrap();
//!
//! let (sender, receiver) = mpsc::channel();
//! let callback = system.callback(Lock::new("example"), move |event: Event| {
//!     sender.send(event.is_done()).unwrap();
//! });
//! let _action = callback.schedule(Event::done());
//! assert!(receiver.recv_timeout(Duration::from_secs(5)).unwrap());
//!
//! system.stop();
//! system.join();
//! ```

use std::{any::Any, io};
use thiserror::Error;
use wanproxy_buffer::Buffer;

mod action;
pub use action::Action;
mod callback;
pub use callback::{Callback, EventCallback, Pending, Scheduler, SimpleCallback, Task};
mod destroy;
pub use destroy::DestroyThread;
mod lock;
pub use lock::{Lock, LockGuard};
mod metrics;
pub use metrics::Metrics;
mod queue;
pub use queue::CallbackQueue;
mod system;
pub use system::{Config, EventSystem, Interest};
mod thread;
pub use thread::{CallbackThread, WorkerPool};
mod timeout;
pub use timeout::TimeoutThread;
cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod poll;
        pub use poll::{EventPoll, PollType};
    }
}

/// Errors carried by [Event::Error].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("closed")]
    Closed,
    #[error("canceled")]
    Canceled,
    #[error("os error: {}", os_error(.0))]
    Os(i32),
    #[error("pipe failed: {0}")]
    Pipe(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Error::Os(code),
            None => match err.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::UnexpectedEof => Error::Closed,
                _ => Error::Pipe(err.to_string()),
            },
        }
    }
}

fn os_error(code: &i32) -> io::Error {
    io::Error::from_raw_os_error(*code)
}

/// The result passed to asynchronous callbacks.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Event {
    /// The operation completed, possibly carrying data.
    Done(Buffer),
    /// No more data will ever arrive on this stream. May carry a final chunk of data.
    Eos(Buffer),
    /// The operation failed.
    Error(Error),
    /// Placeholder for an event that was never set.
    #[default]
    Invalid,
}

impl Event {
    /// A completion without data.
    pub fn done() -> Self {
        Event::Done(Buffer::new())
    }

    /// An end of stream without data.
    pub fn eos() -> Self {
        Event::Eos(Buffer::new())
    }

    /// A failure.
    pub fn error(err: Error) -> Self {
        Event::Error(err)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Event::Done(_))
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Event::Eos(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Event::Error(_))
    }

    /// Returns the data carried by a [Event::Done] or [Event::Eos].
    pub fn buffer(&self) -> Option<&Buffer> {
        match self {
            Event::Done(buffer) | Event::Eos(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Take the data carried by a [Event::Done] or [Event::Eos], leaving it empty.
    pub fn take_buffer(&mut self) -> Buffer {
        match self {
            Event::Done(buffer) | Event::Eos(buffer) => std::mem::take(buffer),
            _ => Buffer::new(),
        }
    }
}

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{:?}", payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPIPE: i32 = 32;

    #[test]
    fn test_error_from_io() {
        let err = io::Error::from_raw_os_error(EPIPE);
        assert_eq!(Error::from(err), Error::Os(EPIPE));

        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(err), Error::Closed);

        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(Error::from(err), Error::Pipe("boom".to_string()));
    }

    #[test]
    fn test_error_display() {
        let err = Error::Os(EPIPE);
        assert!(err.to_string().starts_with("os error: "));
        assert_eq!(Error::Closed.to_string(), "closed");
    }

    #[test]
    fn test_event_buffer() {
        let mut event = Event::Done(Buffer::from("abc"));
        assert!(event.is_done());
        assert_eq!(event.buffer().unwrap(), "abc");
        assert_eq!(event.take_buffer(), "abc");
        assert_eq!(event, Event::done());

        let event = Event::error(Error::Closed);
        assert!(event.is_error());
        assert!(event.buffer().is_none());
        assert_ne!(event, Event::eos());
        assert_eq!(Event::default(), Event::Invalid);
    }
}
