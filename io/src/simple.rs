use crate::{Consumer, Pipe, PipeProducer, Producer};
use wanproxy_buffer::Buffer;
use wanproxy_event::{Action, Error, EventCallback};

/// A transform that needs no control over when output is produced.
pub trait Process: Send + 'static {
    /// Move everything that can be transformed from `input` to `out`.
    ///
    /// Bytes left in `input` are kept and presented again, with more data appended, on the
    /// next call.
    fn process(&mut self, out: &mut Buffer, input: &mut Buffer) -> Result<(), Error>;
}

struct Stage<P> {
    process: P,
    input: Buffer,
}

impl<P: Process> Consumer for Stage<P> {
    fn consume(&mut self, mut input: Buffer, producer: &mut Producer) {
        if input.is_empty() {
            if !self.input.is_empty() {
                let unconsumed = self.input.len();
                producer.produce_error(Error::Pipe(format!(
                    "{unconsumed} bytes unconsumed at end of stream"
                )));
                return;
            }
            producer.produce_eos(Buffer::new());
            return;
        }
        self.input.append(&mut input);
        let mut out = Buffer::new();
        match self.process.process(&mut out, &mut self.input) {
            Ok(()) => producer.produce(out),
            Err(err) => producer.produce_error(err),
        }
    }
}

/// A [Pipe] driven by a [Process].
///
/// Input bytes the [Process] leaves behind at end of stream fail the pipe.
pub struct PipeSimple<P: Process>(PipeProducer<Stage<P>>);

impl<P: Process> PipeSimple<P> {
    pub fn new(process: P) -> Self {
        Self(PipeProducer::new(Stage {
            process,
            input: Buffer::new(),
        }))
    }
}

impl<P: Process> Pipe for PipeSimple<P> {
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action {
        self.0.input(buffer, callback)
    }

    fn output(&self, callback: EventCallback) -> Action {
        self.0.output(callback)
    }
}

struct Identity;

impl Consumer for Identity {
    fn consume(&mut self, input: Buffer, producer: &mut Producer) {
        if input.is_empty() {
            producer.produce_eos(input);
        } else {
            producer.produce(input);
        }
    }
}

/// A [Pipe] whose output is exactly its input.
pub struct PipeNull(PipeProducer<Identity>);

impl PipeNull {
    pub fn new() -> Self {
        Self(PipeProducer::new(Identity))
    }
}

impl Default for PipeNull {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for PipeNull {
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action {
        self.0.input(buffer, callback)
    }

    fn output(&self, callback: EventCallback) -> Action {
        self.0.output(callback)
    }
}

struct Discard;

impl Consumer for Discard {
    fn consume(&mut self, input: Buffer, producer: &mut Producer) {
        if input.is_empty() {
            producer.produce_eos(input);
        }
    }
}

/// A [Pipe] that discards its input. Its only output is end of stream.
pub struct PipeSink(PipeProducer<Discard>);

impl PipeSink {
    pub fn new() -> Self {
        Self(PipeProducer::new(Discard))
    }
}

impl Default for PipeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for PipeSink {
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action {
        self.0.input(buffer, callback)
    }

    fn output(&self, callback: EventCallback) -> Action {
        self.0.output(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::Recorder;
    use std::sync::Arc;
    use wanproxy_event::{CallbackQueue, Event, Lock, Scheduler};
    use wanproxy_macros::test_traced;

    /// Emits complete lines with their terminator replaced by `;`.
    struct Lines;

    impl Process for Lines {
        fn process(&mut self, out: &mut Buffer, input: &mut Buffer) -> Result<(), Error> {
            while let Some(end) = input.find(b'\n') {
                if input.prefix(b"QUIT") {
                    return Err(Error::Protocol("quit".into()));
                }
                input.moveout_into(out, end);
                input.skip(1);
                out.append_byte(b';');
            }
            Ok(())
        }
    }

    fn setup() -> (CallbackQueue, Arc<dyn Scheduler>, Recorder, Lock) {
        let queue = CallbackQueue::new();
        let scheduler: Arc<dyn Scheduler> = Arc::new(queue.clone());
        (queue, scheduler, Recorder::new(), Lock::new("test"))
    }

    #[test_traced]
    fn test_simple_keeps_partial_input() {
        let (queue, scheduler, recorder, lock) = setup();
        let pipe = PipeSimple::new(Lines);

        let _input = pipe.input(Buffer::from("ab\ncd"), recorder.callback(&scheduler, lock.clone()));
        let _input = pipe.input(Buffer::from("e\n"), recorder.callback(&scheduler, lock.clone()));
        let _output = pipe.output(recorder.callback(&scheduler, lock.clone()));
        let _eos = pipe.input(Buffer::new(), recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(
            recorder.take(),
            vec![
                Event::done(),
                Event::done(),
                Event::Done(Buffer::from("ab;cde;")),
                Event::done(),
            ]
        );

        let _output = pipe.output(recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::eos()]);
    }

    #[test_traced]
    fn test_simple_unconsumed_at_eos() {
        let (queue, scheduler, recorder, lock) = setup();
        let pipe = PipeSimple::new(Lines);

        let _input = pipe.input(Buffer::from("partial"), recorder.callback(&scheduler, lock.clone()));
        let _eos = pipe.input(Buffer::new(), recorder.callback(&scheduler, lock.clone()));
        let _output = pipe.output(recorder.callback(&scheduler, lock));
        queue.drain();
        let err = Error::Pipe("7 bytes unconsumed at end of stream".into());
        assert_eq!(
            recorder.take(),
            vec![
                Event::done(),
                Event::Error(err.clone()),
                Event::Error(err),
            ]
        );
    }

    #[test_traced]
    fn test_simple_process_error() {
        let (queue, scheduler, recorder, lock) = setup();
        let pipe = PipeSimple::new(Lines);

        let _input = pipe.input(Buffer::from("QUIT\n"), recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(
            recorder.take(),
            vec![Event::Error(Error::Protocol("quit".into()))]
        );
    }

    #[test_traced]
    fn test_null() {
        let (queue, scheduler, recorder, lock) = setup();
        let pipe = PipeNull::new();

        let _input = pipe.input(Buffer::from("same"), recorder.callback(&scheduler, lock.clone()));
        let _output = pipe.output(recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(
            recorder.take(),
            vec![Event::done(), Event::Done(Buffer::from("same"))]
        );

        let _output = pipe.output(recorder.callback(&scheduler, lock.clone()));
        let _eos = pipe.input(Buffer::new(), recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::eos(), Event::done()]);
    }

    #[test_traced]
    fn test_sink() {
        let (queue, scheduler, recorder, lock) = setup();
        let pipe = PipeSink::new();

        let _output = pipe.output(recorder.callback(&scheduler, lock.clone()));
        let _input = pipe.input(Buffer::from("gone"), recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::done()]);

        let _eos = pipe.input(Buffer::new(), recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::eos(), Event::done()]);
    }
}
