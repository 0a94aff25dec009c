use crate::{Pipe, PipeNull, StreamChannel};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};
use wanproxy_buffer::Buffer;
use wanproxy_event::{Action, Callback, Error, Event, EventCallback, Lock, Scheduler};

#[derive(Default)]
struct State {
    callback: Option<EventCallback>,
    complete: Option<Action>,

    read: Option<Action>,
    input: Option<Action>,
    output: Option<Action>,
    write: Option<Action>,
    shutdown: Option<Action>,

    /// The source reached end of stream.
    source_eos: bool,
    /// End of stream was handed to the pipe.
    input_eos: bool,
    /// The pipe reached end of stream.
    output_eos: bool,
    finished: bool,
}

impl State {
    fn release(&mut self) -> Vec<Action> {
        [
            self.read.take(),
            self.input.take(),
            self.output.take(),
            self.write.take(),
            self.shutdown.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

struct Inner {
    source: Arc<dyn StreamChannel>,
    pipe: Arc<dyn Pipe>,
    sink: Arc<dyn StreamChannel>,
    scheduler: Arc<dyn Scheduler>,
    lock: Lock,
    state: Mutex<State>,
}

impl Inner {
    /// Create a callback that runs `handler` unless the splice already finished.
    fn callback(
        self: &Arc<Self>,
        handler: fn(&Arc<Self>, &mut State, Event),
    ) -> EventCallback {
        let inner = Arc::downgrade(self);
        Callback::new(self.scheduler.clone(), self.lock.clone(), move |event| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().unwrap();
            if !state.finished {
                handler(&inner, &mut state, event);
            }
        })
    }

    fn read(self: &Arc<Self>, state: &mut State) {
        state.read = Some(self.source.read(0, self.callback(Self::read_complete)));
    }

    fn read_complete(self: &Arc<Self>, state: &mut State, event: Event) {
        state.read = None;
        match event {
            Event::Done(buffer) => self.input(state, buffer),
            Event::Eos(buffer) => {
                state.source_eos = true;
                self.input(state, buffer);
            }
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from source"),
        }
    }

    fn input(self: &Arc<Self>, state: &mut State, buffer: Buffer) {
        if buffer.is_empty() {
            if !state.source_eos {
                self.read(state);
                return;
            }
            state.input_eos = true;
        }
        state.input = Some(self.pipe.input(buffer, self.callback(Self::input_complete)));
    }

    fn input_complete(self: &Arc<Self>, state: &mut State, event: Event) {
        state.input = None;
        match event {
            Event::Done(_) | Event::Eos(_) => {
                if !state.source_eos {
                    self.read(state);
                } else if !state.input_eos {
                    self.input(state, Buffer::new());
                }
            }
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from pipe input"),
        }
    }

    fn output(self: &Arc<Self>, state: &mut State) {
        state.output = Some(self.pipe.output(self.callback(Self::output_complete)));
    }

    fn output_complete(self: &Arc<Self>, state: &mut State, event: Event) {
        state.output = None;
        match event {
            Event::Done(buffer) if buffer.is_empty() => self.output(state),
            Event::Done(buffer) => self.write(state, buffer),
            Event::Eos(buffer) => {
                state.output_eos = true;
                if buffer.is_empty() {
                    self.shutdown(state);
                } else {
                    self.write(state, buffer);
                }
            }
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from pipe output"),
        }
    }

    fn write(self: &Arc<Self>, state: &mut State, buffer: Buffer) {
        trace!(len = buffer.len(), "splice write");
        state.write = Some(self.sink.write(buffer, self.callback(Self::write_complete)));
    }

    fn write_complete(self: &Arc<Self>, state: &mut State, event: Event) {
        state.write = None;
        match event {
            Event::Done(_) | Event::Eos(_) if state.output_eos => self.shutdown(state),
            Event::Done(_) | Event::Eos(_) => self.output(state),
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from sink"),
        }
    }

    fn shutdown(self: &Arc<Self>, state: &mut State) {
        let callback = self.callback(Self::shutdown_complete);
        state.shutdown = Some(self.sink.shutdown(false, true, callback));
    }

    fn shutdown_complete(self: &Arc<Self>, state: &mut State, event: Event) {
        state.shutdown = None;
        match event {
            Event::Done(_) | Event::Eos(_) => self.finish(state, Event::eos()),
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from sink shutdown"),
        }
    }

    fn fail(self: &Arc<Self>, state: &mut State, err: Error) {
        debug!(?err, "splice failed");
        self.finish(state, Event::Error(err));
    }

    fn finish(self: &Arc<Self>, state: &mut State, event: Event) {
        state.finished = true;
        drop(state.release());
        if let Some(callback) = state.callback.take() {
            state.complete = Some(callback.schedule(event));
        }
    }
}

/// Pump bytes from a source [StreamChannel], through a [Pipe], into a sink
/// [StreamChannel].
///
/// The splice reads from the source and feeds the pipe on one side while it pulls the
/// pipe's output and writes it to the sink on the other. Once the pipe reports end of
/// stream and the final write completes, the sink's write side is shut down and the
/// splice completes with [Event::Eos]. An error at any stage releases every in-flight
/// operation and completes the splice with that error.
pub struct Splice {
    source: Arc<dyn StreamChannel>,
    pipe: Arc<dyn Pipe>,
    sink: Arc<dyn StreamChannel>,
}

impl Splice {
    /// Create a splice. Without a `pipe`, bytes are copied unchanged.
    pub fn new(
        source: Arc<dyn StreamChannel>,
        pipe: Option<Arc<dyn Pipe>>,
        sink: Arc<dyn StreamChannel>,
    ) -> Self {
        Self {
            source,
            pipe: pipe.unwrap_or_else(|| Arc::new(PipeNull::new())),
            sink,
        }
    }

    /// Start pumping. `callback` fires exactly once, with [Event::Eos] or [Event::Error].
    ///
    /// Releasing the returned [Action] stops the splice and releases everything it has in
    /// flight.
    pub fn start(self, callback: EventCallback) -> Action {
        let inner = Arc::new(Inner {
            source: self.source,
            pipe: self.pipe,
            sink: self.sink,
            scheduler: callback.scheduler().clone(),
            lock: Lock::new("splice"),
            state: Mutex::new(State {
                callback: Some(callback),
                ..Default::default()
            }),
        });
        {
            let mut state = inner.state.lock().unwrap();
            inner.read(&mut state);
            inner.output(&mut state);
        }
        Action::new(move || {
            let mut state = inner.state.lock().unwrap();
            state.finished = true;
            state.callback = None;
            let mut released = state.release();
            released.extend(state.complete.take());
            drop(state);
            drop(released);
        })
    }
}
