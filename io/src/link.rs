use crate::Pipe;
use std::sync::{Arc, Mutex};
use tracing::debug;
use wanproxy_buffer::Buffer;
use wanproxy_event::{Action, Callback, Error, Event, EventCallback, Lock, Pending, Scheduler};

/// A reader waiting on the second pipe.
struct Output {
    id: u64,
    pending: Pending<Event>,
    forward: Action,
}

#[derive(Default)]
struct State {
    /// The in-flight `first.output` or `second.input`.
    pump: Option<Action>,
    /// The first pipe reached end of stream.
    first_eos: bool,
    /// End of stream was handed to the second pipe.
    second_eos: bool,
    error: Option<Error>,
    output: Option<Output>,
    /// Output of the second pipe whose reader let go just before delivery.
    stash: Option<Event>,
    next_id: u64,
}

struct Inner {
    first: Arc<dyn Pipe>,
    second: Arc<dyn Pipe>,
    scheduler: Arc<dyn Scheduler>,
    lock: Lock,
    state: Mutex<State>,
}

impl Inner {
    fn callback(
        self: &Arc<Self>,
        handler: impl FnOnce(&Arc<Self>, &mut State, Event) + Send + 'static,
    ) -> EventCallback {
        let inner = Arc::downgrade(self);
        Callback::new(self.scheduler.clone(), self.lock.clone(), move |event| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().unwrap();
            handler(&inner, &mut state, event);
        })
    }

    fn pull(self: &Arc<Self>, state: &mut State) {
        state.pump = Some(self.first.output(self.callback(Self::pulled)));
    }

    fn pulled(self: &Arc<Self>, state: &mut State, event: Event) {
        state.pump = None;
        match event {
            Event::Done(buffer) => self.push(state, buffer),
            Event::Eos(buffer) => {
                state.first_eos = true;
                self.push(state, buffer);
            }
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from first pipe"),
        }
    }

    fn push(self: &Arc<Self>, state: &mut State, buffer: Buffer) {
        if buffer.is_empty() {
            if !state.first_eos {
                self.pull(state);
                return;
            }
            state.second_eos = true;
        }
        state.pump = Some(self.second.input(buffer, self.callback(Self::pushed)));
    }

    fn pushed(self: &Arc<Self>, state: &mut State, event: Event) {
        state.pump = None;
        match event {
            Event::Done(_) | Event::Eos(_) => {
                if !state.first_eos {
                    self.pull(state);
                } else if !state.second_eos {
                    self.push(state, Buffer::new());
                }
            }
            Event::Error(err) => self.fail(state, err),
            Event::Invalid => panic!("invalid event from second pipe"),
        }
    }

    fn fail(self: &Arc<Self>, state: &mut State, err: Error) {
        debug!(?err, "pipe link failed");
        state.error = Some(err.clone());
        drop(state.pump.take());
        if let Some(output) = state.output.take() {
            drop(output.forward);
            let _ = output.pending.fire(Event::Error(err));
        }
    }

    /// Hand the second pipe's output to the reader that asked for it.
    fn delivered(self: &Arc<Self>, state: &mut State, id: u64, event: Event) {
        if !state.output.as_ref().is_some_and(|output| output.id == id) {
            return;
        }
        if let Some(output) = state.output.take() {
            if let Err(event) = output.pending.fire(event) {
                debug!("pipe link output released during delivery");
                state.stash = Some(event);
            }
        }
    }
}

/// Two [Pipe]s joined into one: input goes to the first, output comes from the second,
/// and an internal pump moves the first pipe's output into the second.
///
/// Once the pump fails, its error is reported to the reader waiting on the link (if any)
/// and to every later [Pipe::input] and [Pipe::output].
pub struct PipeLink {
    inner: Arc<Inner>,
}

impl PipeLink {
    /// Join `first` to `second`, running the pump's callbacks on `scheduler`.
    pub fn new(scheduler: Arc<dyn Scheduler>, first: Arc<dyn Pipe>, second: Arc<dyn Pipe>) -> Self {
        let inner = Arc::new(Inner {
            first,
            second,
            scheduler,
            lock: Lock::new("pipe-link"),
            state: Mutex::new(State::default()),
        });
        {
            let mut state = inner.state.lock().unwrap();
            inner.pull(&mut state);
        }
        Self { inner }
    }
}

impl Pipe for PipeLink {
    fn input(&self, buffer: Buffer, callback: EventCallback) -> Action {
        let state = self.inner.state.lock().unwrap();
        if let Some(err) = &state.error {
            return callback.schedule(Event::Error(err.clone()));
        }
        drop(state);
        self.inner.first.input(buffer, callback)
    }

    /// # Panics
    ///
    /// Panics if an output is already outstanding.
    fn output(&self, callback: EventCallback) -> Action {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(err) = &state.error {
            return callback.schedule(Event::Error(err.clone()));
        }
        let outstanding = state
            .output
            .as_ref()
            .is_some_and(|output| !output.pending.is_cancelled());
        if outstanding {
            drop(state);
            panic!("output already outstanding");
        }
        drop(state.output.take());
        if let Some(event) = state.stash.take() {
            return callback.schedule(event);
        }

        let id = state.next_id;
        state.next_id += 1;
        let (pending, action) = Pending::new(callback);
        let forward = self.inner.second.output(self.inner.callback(move |inner, state, event| {
            inner.delivered(state, id, event)
        }));
        state.output = Some(Output {
            id,
            pending,
            forward,
        });

        let inner = Arc::downgrade(&self.inner);
        action.join(Action::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().unwrap();
            if state.output.as_ref().is_some_and(|output| output.id == id) {
                let output = state.output.take();
                drop(state);
                drop(output);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::Recorder, PipeNull, PipeSimple, Process};
    use wanproxy_event::CallbackQueue;
    use wanproxy_macros::test_traced;

    /// Doubles every byte and rejects `!`.
    struct Double;

    impl Process for Double {
        fn process(&mut self, out: &mut Buffer, input: &mut Buffer) -> Result<(), Error> {
            if input.find(b'!').is_some() {
                return Err(Error::Protocol("bang".into()));
            }
            for byte in input.to_vec() {
                out.append_slice(&[byte, byte]);
            }
            input.clear();
            Ok(())
        }
    }

    fn setup() -> (CallbackQueue, Arc<dyn Scheduler>, Recorder, Lock) {
        let queue = CallbackQueue::new();
        let scheduler: Arc<dyn Scheduler> = Arc::new(queue.clone());
        (queue, scheduler, Recorder::new(), Lock::new("test"))
    }

    #[test_traced]
    fn test_composes() {
        let (queue, scheduler, recorder, lock) = setup();
        let link = PipeLink::new(
            scheduler.clone(),
            Arc::new(PipeSimple::new(Double)),
            Arc::new(PipeSimple::new(Double)),
        );

        let _input = link.input(Buffer::from("ab"), recorder.callback(&scheduler, lock.clone()));
        let _output = link.output(recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(
            recorder.take(),
            vec![Event::done(), Event::Done(Buffer::from("aaaabbbb"))]
        );

        let _input = link.input(Buffer::new(), recorder.callback(&scheduler, lock.clone()));
        let _output = link.output(recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::done(), Event::eos()]);
    }

    #[test_traced]
    fn test_released_output() {
        let (queue, scheduler, recorder, lock) = setup();
        let link = PipeLink::new(
            scheduler.clone(),
            Arc::new(PipeNull::new()),
            Arc::new(PipeNull::new()),
        );

        let output = link.output(recorder.callback(&scheduler, lock.clone()));
        output.cancel();
        let _input = link.input(Buffer::from("kept"), recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::done()]);

        let _output = link.output(recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::Done(Buffer::from("kept"))]);
    }

    #[test_traced]
    fn test_output_released_during_delivery() {
        let (queue, scheduler, recorder, lock) = setup();
        let link = PipeLink::new(
            scheduler.clone(),
            Arc::new(PipeNull::new()),
            Arc::new(PipeNull::new()),
        );

        // The reader lets go of its callback while the second pipe's output is on its way
        let _output = link.output(recorder.callback(&scheduler, lock.clone()));
        {
            let (released, action) = Pending::new(recorder.callback(&scheduler, lock.clone()));
            action.cancel();
            let mut state = link.inner.state.lock().unwrap();
            state.output.as_mut().unwrap().pending = released;
        }
        let _input = link.input(Buffer::from("kept"), recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::done()]);

        let _output = link.output(recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(recorder.take(), vec![Event::Done(Buffer::from("kept"))]);
    }

    #[test_traced]
    fn test_error_is_replayed() {
        let (queue, scheduler, recorder, lock) = setup();
        let link = PipeLink::new(
            scheduler.clone(),
            Arc::new(PipeSimple::new(Double)),
            Arc::new(PipeNull::new()),
        );
        let err = Error::Protocol("bang".into());

        let _output = link.output(recorder.callback(&scheduler, lock.clone()));
        let _input = link.input(Buffer::from("!"), recorder.callback(&scheduler, lock.clone()));
        queue.drain();
        assert_eq!(
            recorder.take(),
            vec![Event::Error(err.clone()), Event::Error(err.clone())]
        );

        let _input = link.input(Buffer::from("ok"), recorder.callback(&scheduler, lock.clone()));
        let _output = link.output(recorder.callback(&scheduler, lock));
        queue.drain();
        assert_eq!(
            recorder.take(),
            vec![Event::Error(err.clone()), Event::Error(err)]
        );
    }
}
