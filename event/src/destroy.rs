use crate::{Error, Lock, Metrics};
use std::{
    any::Any,
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};
use tracing::{debug, trace};

/// An object waiting to be dropped under a lock.
struct Deferred {
    lock: Lock,
    object: Box<dyn Any + Send>,
}

struct State {
    queue: VecDeque<Deferred>,
    stopping: bool,
}

struct Inner {
    name: String,
    metrics: Metrics,
    state: Mutex<State>,
    wake: Condvar,
}

impl Inner {
    fn destroy(&self, deferred: Deferred) {
        let Deferred { lock, object } = deferred;
        let _guard = lock.lock();
        drop(object);
        self.metrics.destroys.inc();
        trace!(lock = lock.name(), "destroyed");
    }

    fn run(&self) {
        debug!(name = self.name, "destroy thread started");
        loop {
            let deferred = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(deferred) = state.queue.pop_front() {
                        break Some(deferred);
                    }
                    if state.stopping {
                        break None;
                    }
                    state = self.wake.wait(state).unwrap();
                }
            };
            match deferred {
                Some(deferred) => self.destroy(deferred),
                None => break,
            }
        }
        debug!(name = self.name, "destroy thread exited");
    }
}

/// A thread that drops objects only after acquiring a specified [Lock].
///
/// This decouples deciding that an object should go away from holding the lock needed to
/// tear it down safely: code running under one lock can hand off an object guarded by
/// another without risking lock-order inversions or re-entrant destruction.
pub struct DestroyThread {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DestroyThread {
    pub fn new(name: impl Into<String>, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                metrics,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    stopping: false,
                }),
                wake: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Drop `object` on the destroy thread while holding `lock`.
    pub fn destroy<T: Send + 'static>(&self, lock: Lock, object: T) {
        let deferred = Deferred {
            lock,
            object: Box::new(object),
        };
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(deferred);
        self.inner.wake.notify_one();
    }

    /// Returns the number of objects waiting to be dropped.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread was already started.
    pub fn start(&self) -> Result<(), Error> {
        let mut handle = self.handle.lock().unwrap();
        assert!(handle.is_none(), "destroy thread already started");
        let inner = self.inner.clone();
        *handle = Some(
            thread::Builder::new()
                .name(self.inner.name.clone())
                .spawn(move || inner.run())?,
        );
        Ok(())
    }

    /// Ask the thread to exit once every queued object has been dropped.
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
