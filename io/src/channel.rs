use wanproxy_buffer::Buffer;
use wanproxy_event::{Action, EventCallback, SimpleCallback};

/// Anything that can be closed.
pub trait Channel: Send + Sync {
    /// Release the channel, calling `callback` once it is closed.
    fn close(&self, callback: SimpleCallback) -> Action;
}

/// A byte stream (a socket, a pipe, a serial port).
///
/// Every operation completes by scheduling its callback exactly once (unless released
/// first) with [wanproxy_event::Event::Done], [wanproxy_event::Event::Eos], or
/// [wanproxy_event::Event::Error]. At most one read and one write may be outstanding.
pub trait StreamChannel: Channel {
    /// Read up to `max` bytes (any amount when `max` is 0).
    ///
    /// Completes with `Done` and the data, or `Eos` (possibly with a final chunk of data)
    /// once the peer will send nothing more.
    fn read(&self, max: usize, callback: EventCallback) -> Action;

    /// Write all of `buffer`, completing with `Done`.
    fn write(&self, buffer: Buffer, callback: EventCallback) -> Action;

    /// Shut down the read side, the write side, or both.
    fn shutdown(&self, read: bool, write: bool, callback: EventCallback) -> Action;
}

/// A device addressed in fixed-size blocks.
pub trait BlockChannel: Channel {
    /// Returns the size of every block, in bytes.
    fn block_size(&self) -> usize;

    /// Read block `block`, completing with `Done` and exactly [BlockChannel::block_size]
    /// bytes.
    fn read(&self, block: u64, callback: EventCallback) -> Action;

    /// Overwrite block `block` with `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is not exactly [BlockChannel::block_size] bytes.
    fn write(&self, block: u64, buffer: Buffer, callback: EventCallback) -> Action;
}
