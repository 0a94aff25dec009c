//! In-memory channels for tests and demos.

use crate::{BlockChannel, Channel, StreamChannel};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use wanproxy_buffer::Buffer;
use wanproxy_event::{
    Action, Error, Event, EventCallback, Lock, Pending, Scheduler, SimpleCallback,
};

/// Collects every [Event] delivered to the callbacks it creates.
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    /// Create a recorder with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a callback that appends its [Event] to the log.
    pub fn callback(&self, scheduler: &Arc<dyn Scheduler>, lock: Lock) -> EventCallback {
        let events = self.events.clone();
        EventCallback::new(scheduler.clone(), lock, move |event| {
            events.lock().unwrap().push(event)
        })
    }

    /// Remove and return every recorded [Event].
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Reader {
    max: usize,
    pending: Pending<Event>,
}

/// One direction of a [pair].
#[derive(Default)]
struct Stream {
    data: Buffer,
    /// The writer shut down its side.
    eos: bool,
    /// The reader shut down its side.
    closed: bool,
    reader: Option<Reader>,
}

impl Stream {
    fn take(&mut self, max: usize) -> Option<Event> {
        if !self.data.is_empty() {
            let len = match max {
                0 => self.data.len(),
                max => max.min(self.data.len()),
            };
            let mut chunk = Buffer::new();
            self.data.moveout_into(&mut chunk, len);
            return Some(Event::Done(chunk));
        }
        if self.eos || self.closed {
            return Some(Event::eos());
        }
        None
    }

    /// Deliver to a parked reader, if there is something to deliver.
    fn wake(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let Some(event) = self.take(reader.max) else {
            self.reader = Some(reader);
            return;
        };
        if let Err(mut event) = reader.pending.fire(event) {
            // The reader went away, so keep the data for the next one
            let mut data = event.take_buffer();
            data.append(&mut self.data);
            self.data = data;
        }
    }
}

/// One end of an in-memory, full-duplex [StreamChannel] created by [pair].
pub struct Endpoint {
    incoming: Arc<Mutex<Stream>>,
    outgoing: Arc<Mutex<Stream>>,
}

/// Create two connected [Endpoint]s: bytes written to one are read from the other.
pub fn pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    let forward = Arc::new(Mutex::new(Stream::default()));
    let backward = Arc::new(Mutex::new(Stream::default()));
    let left = Endpoint {
        incoming: backward.clone(),
        outgoing: forward.clone(),
    };
    let right = Endpoint {
        incoming: forward,
        outgoing: backward,
    };
    (Arc::new(left), Arc::new(right))
}

impl Endpoint {
    /// Returns the number of bytes written by the peer and not yet read.
    pub fn buffered(&self) -> usize {
        self.incoming.lock().unwrap().data.len()
    }

    fn shut(&self, read: bool, write: bool) {
        if read {
            let mut stream = self.incoming.lock().unwrap();
            stream.closed = true;
            stream.data.clear();
            stream.wake();
        }
        if write {
            let mut stream = self.outgoing.lock().unwrap();
            stream.eos = true;
            stream.wake();
        }
    }
}

impl Channel for Endpoint {
    fn close(&self, callback: SimpleCallback) -> Action {
        self.shut(true, true);
        callback.schedule(())
    }
}

impl StreamChannel for Endpoint {
    /// # Panics
    ///
    /// Panics if a read is already outstanding.
    fn read(&self, max: usize, callback: EventCallback) -> Action {
        let mut stream = self.incoming.lock().unwrap();
        let outstanding = stream
            .reader
            .as_ref()
            .is_some_and(|reader| !reader.pending.is_cancelled());
        if outstanding {
            drop(stream);
            panic!("read already outstanding");
        }
        stream.reader = None;
        if let Some(event) = stream.take(max) {
            return callback.schedule(event);
        }
        let (pending, action) = Pending::new(callback);
        stream.reader = Some(Reader { max, pending });
        action
    }

    fn write(&self, mut buffer: Buffer, callback: EventCallback) -> Action {
        let mut stream = self.outgoing.lock().unwrap();
        if stream.eos || stream.closed {
            return callback.schedule(Event::Error(Error::Closed));
        }
        stream.data.append(&mut buffer);
        stream.wake();
        callback.schedule(Event::done())
    }

    fn shutdown(&self, read: bool, write: bool, callback: EventCallback) -> Action {
        self.shut(read, write);
        callback.schedule(Event::done())
    }
}

/// A [StreamChannel] that fails reads and/or writes with a configured [Error], passing
/// everything else to an [Endpoint].
pub struct Faulty {
    endpoint: Arc<Endpoint>,
    reads: Option<Error>,
    writes: Option<Error>,
}

impl Faulty {
    /// Wrap `endpoint`, passing every operation through until a failure is configured.
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            reads: None,
            writes: None,
        }
    }

    /// Fail every read with `err`.
    pub fn fail_reads(mut self, err: Error) -> Self {
        self.reads = Some(err);
        self
    }

    /// Fail every write with `err`.
    pub fn fail_writes(mut self, err: Error) -> Self {
        self.writes = Some(err);
        self
    }
}

impl Channel for Faulty {
    fn close(&self, callback: SimpleCallback) -> Action {
        self.endpoint.close(callback)
    }
}

impl StreamChannel for Faulty {
    fn read(&self, max: usize, callback: EventCallback) -> Action {
        match &self.reads {
            Some(err) => callback.schedule(Event::Error(err.clone())),
            None => self.endpoint.read(max, callback),
        }
    }

    fn write(&self, buffer: Buffer, callback: EventCallback) -> Action {
        match &self.writes {
            Some(err) => callback.schedule(Event::Error(err.clone())),
            None => self.endpoint.write(buffer, callback),
        }
    }

    fn shutdown(&self, read: bool, write: bool, callback: EventCallback) -> Action {
        self.endpoint.shutdown(read, write, callback)
    }
}

#[derive(Default)]
struct Blocks {
    blocks: HashMap<u64, Buffer>,
    closed: bool,
}

/// An in-memory [BlockChannel]. Blocks never written read back as zeros.
pub struct MemoryBlock {
    block_size: usize,
    state: Mutex<Blocks>,
}

impl MemoryBlock {
    /// Create an empty device of `block_size`-byte blocks.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            state: Mutex::new(Blocks::default()),
        }
    }
}

impl Channel for MemoryBlock {
    fn close(&self, callback: SimpleCallback) -> Action {
        self.state.lock().unwrap().closed = true;
        callback.schedule(())
    }
}

impl BlockChannel for MemoryBlock {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read(&self, block: u64, callback: EventCallback) -> Action {
        let state = self.state.lock().unwrap();
        if state.closed {
            return callback.schedule(Event::Error(Error::Closed));
        }
        let data = match state.blocks.get(&block) {
            Some(data) => data.clone(),
            None => Buffer::from(vec![0u8; self.block_size]),
        };
        callback.schedule(Event::Done(data))
    }

    fn write(&self, block: u64, buffer: Buffer, callback: EventCallback) -> Action {
        assert_eq!(
            buffer.len(),
            self.block_size,
            "block write of {} bytes",
            buffer.len()
        );
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return callback.schedule(Event::Error(Error::Closed));
        }
        state.blocks.insert(block, buffer);
        callback.schedule(Event::done())
    }
}
