use crate::Pipe;
use std::sync::Mutex;
use wanproxy_buffer::Buffer;
use wanproxy_event::{Action, Error, Event, EventCallback, Pending};

/// The transform behind a [PipeProducer].
pub trait Consumer: Send + 'static {
    /// Transform `input`, emitting results through `producer`.
    ///
    /// An empty `input` means the writer reached end of stream: the consumer should flush
    /// anything it is holding and call [Producer::produce_eos] (or
    /// [Producer::produce_error]).
    fn consume(&mut self, input: Buffer, producer: &mut Producer);
}

/// Output emitted by a [Consumer] and not yet delivered to a reader.
#[derive(Debug, Default)]
pub struct Producer {
    buffer: Buffer,
    eos: bool,
    delivered: bool,
    error: Option<Error>,
}

impl Producer {
    /// Emit `buffer`. Ignored once an error was produced.
    ///
    /// # Panics
    ///
    /// Panics if end of stream was already produced.
    pub fn produce(&mut self, mut buffer: Buffer) {
        assert!(!self.eos, "produce after end of stream");
        if self.error.is_none() {
            self.buffer.append(&mut buffer);
        }
    }

    /// Emit a final `buffer` (possibly empty) and end the stream.
    ///
    /// # Panics
    ///
    /// Panics if end of stream was already produced.
    pub fn produce_eos(&mut self, buffer: Buffer) {
        self.produce(buffer);
        self.eos = true;
    }

    /// Fail the pipe. Only the first error is kept; it is reported to every later reader
    /// and writer.
    pub fn produce_error(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Returns the next [Event] for a reader, if one is ready.
    fn next(&mut self) -> Option<Event> {
        if let Some(err) = &self.error {
            return Some(Event::Error(err.clone()));
        }
        if self.eos {
            if self.delivered {
                return None;
            }
            self.delivered = true;
            return Some(Event::Eos(std::mem::take(&mut self.buffer)));
        }
        if self.buffer.is_empty() {
            return None;
        }
        Some(Event::Done(std::mem::take(&mut self.buffer)))
    }

    /// Put back an [Event] whose reader went away before it could be delivered.
    fn restore(&mut self, mut event: Event) {
        if event.is_eos() {
            self.delivered = false;
        }
        let mut buffer = event.take_buffer();
        buffer.append(&mut self.buffer);
        self.buffer = buffer;
    }
}

struct State<C> {
    consumer: C,
    producer: Producer,
    input_eos: bool,
    output: Option<Pending<Event>>,
}

impl<C> State<C> {
    /// Hand the next [Event] to a parked reader, if there is one.
    fn deliver(&mut self) {
        let Some(pending) = self.output.take() else {
            return;
        };
        let Some(event) = self.producer.next() else {
            self.output = Some(pending);
            return;
        };
        if let Err(event) = pending.fire(event) {
            self.producer.restore(event);
        }
    }

    fn outstanding(&self) -> bool {
        self.output
            .as_ref()
            .is_some_and(|pending| !pending.is_cancelled())
    }
}

/// A [Pipe] that turns every input into zero or more outputs with a [Consumer].
///
/// Each [Pipe::input] is consumed synchronously, so the input callback fires as soon as
/// [Consumer::consume] returns. Produced data accumulates until a reader asks for it with
/// [Pipe::output]; a reader that arrives first is parked until something is produced.
pub struct PipeProducer<C: Consumer> {
    state: Mutex<State<C>>,
}

impl<C: Consumer> PipeProducer<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            state: Mutex::new(State {
                consumer,
                producer: Producer::default(),
                input_eos: false,
                output: None,
            }),
        }
    }
}

impl<C: Consumer> Pipe for PipeProducer<C> {
    /// # Panics
    ///
    /// Panics if end of stream was already input.
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.producer.error() {
            return callback.schedule(Event::Error(err.clone()));
        }
        if state.input_eos {
            drop(state);
            panic!("input after end of stream");
        }
        state.input_eos = buffer.is_empty();
        let State {
            consumer, producer, ..
        } = &mut *state;
        consumer.consume(buffer, producer);
        state.deliver();
        match state.producer.error() {
            Some(err) => callback.schedule(Event::Error(err.clone())),
            None => callback.schedule(Event::done()),
        }
    }

    /// # Panics
    ///
    /// Panics if an output is already outstanding or end of stream was already delivered.
    fn output(&self, callback: EventCallback) -> Action {
        let mut state = self.state.lock().unwrap();
        let finished = state.producer.delivered && state.producer.error.is_none();
        if finished || state.outstanding() {
            drop(state);
            if finished {
                panic!("output after end of stream");
            }
            panic!("output already outstanding");
        }
        if let Some(event) = state.producer.next() {
            state.output = None;
            return callback.schedule(event);
        }
        let (pending, action) = Pending::new(callback);
        state.output = Some(pending);
        action
    }
}
