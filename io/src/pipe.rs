use std::sync::Arc;
use wanproxy_buffer::Buffer;
use wanproxy_event::{Action, EventCallback};

/// A stateful, single-input and single-output asynchronous transform over [Buffer]s.
///
/// A writer hands data to the pipe with [Pipe::input] and a reader pulls transformed data
/// with [Pipe::output]. An empty input signals end of stream. At most one
/// [Pipe::output] may be outstanding at a time; violating this is a programmer error and
/// panics.
pub trait Pipe: Send + Sync {
    /// Hand `buffer` to the pipe (an empty `buffer` signals end of stream).
    ///
    /// `callback` fires with `Done` once the pipe has accepted the data (not once the data
    /// has been read back out), or with `Error` if the pipe has failed.
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action;

    /// Request the next chunk of transformed data.
    ///
    /// `callback` fires with `Done` and a non-empty buffer, with `Eos` (and possibly a
    /// final chunk) exactly once when the stream ends, or with `Error`.
    fn output(&self, callback: EventCallback) -> Action;
}

impl<P: Pipe + ?Sized> Pipe for Arc<P> {
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action {
        (**self).input(buffer, callback)
    }

    fn output(&self, callback: EventCallback) -> Action {
        (**self).output(callback)
    }
}
