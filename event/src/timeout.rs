use crate::{Action, CallbackQueue, Error, Metrics, Scheduler, Task};
use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

struct State {
    deadlines: BTreeMap<Instant, CallbackQueue>,
    stopping: bool,
}

struct Inner {
    name: String,
    target: Arc<dyn Scheduler>,
    metrics: Metrics,
    state: Mutex<State>,
    wake: Condvar,
}

impl Inner {
    fn run(&self) {
        debug!(name = self.name, "timeout thread started");
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopping {
                break;
            }
            let now = Instant::now();
            let next = state.deadlines.keys().next().copied();
            let Some(deadline) = next else {
                state = self.wake.wait(state).unwrap();
                continue;
            };
            if deadline > now {
                state = self.wake.wait_timeout(state, deadline - now).unwrap().0;
                continue;
            }
            let Some((_, queue)) = state.deadlines.pop_first() else {
                continue;
            };
            drop(state);
            let forwarded = queue.forward(&*self.target);
            trace!(?deadline, forwarded, "timeouts fired");
            state = self.state.lock().unwrap();
        }
        let armed: usize = state.deadlines.values().map(CallbackQueue::len).sum();
        state.deadlines.clear();
        debug!(name = self.name, armed, "timeout thread exited");
    }
}

/// A thread that hands callbacks to a runner once their deadline passes.
///
/// Deadlines are kept in a time-ordered map of deadline to [CallbackQueue]. Timeouts with an
/// identical deadline share one queue. When a deadline passes, its whole queue is forwarded
/// (in submission order) to the target [Scheduler], and due deadlines are always forwarded
/// in deadline order.
pub struct TimeoutThread {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutThread {
    pub fn new(name: impl Into<String>, target: Arc<dyn Scheduler>, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                target,
                metrics,
                state: Mutex::new(State {
                    deadlines: BTreeMap::new(),
                    stopping: false,
                }),
                wake: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Run `task` (on the target scheduler) once `delay` has elapsed.
    pub fn timeout(&self, delay: Duration, task: Task) -> Action {
        self.at(Instant::now() + delay, task)
    }

    /// Run `task` (on the target scheduler) once `deadline` has passed.
    ///
    /// Cancelling the returned [Action] before the deadline removes the entry.
    pub fn at(&self, deadline: Instant, task: Task) -> Action {
        let mut state = self.inner.state.lock().unwrap();
        let earliest = state
            .deadlines
            .first_key_value()
            .map_or(true, |(first, _)| deadline < *first);
        let queue = state.deadlines.entry(deadline).or_default().clone();
        let scheduled = queue.schedule(task);
        self.inner.metrics.timeouts.inc();
        if earliest {
            self.inner.wake.notify_one();
        }
        drop(state);

        let inner = Arc::downgrade(&self.inner);
        Action::new(move || {
            scheduled.cancel();
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().unwrap();
            if state.deadlines.get(&deadline).is_some_and(CallbackQueue::is_empty) {
                state.deadlines.remove(&deadline);
            }
        })
    }

    /// Returns the number of distinct deadlines armed.
    pub fn deadlines(&self) -> usize {
        self.inner.state.lock().unwrap().deadlines.len()
    }

    /// Spawn the thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread was already started.
    pub fn start(&self) -> Result<(), Error> {
        let mut handle = self.handle.lock().unwrap();
        assert!(handle.is_none(), "timeout thread already started");
        let inner = self.inner.clone();
        *handle = Some(
            thread::Builder::new()
                .name(self.inner.name.clone())
                .spawn(move || inner.run())?,
        );
        Ok(())
    }

    /// Ask the thread to exit. Timeouts still armed are dropped without running.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stopping = true;
        self.inner.wake.notify_all();
    }

    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}
