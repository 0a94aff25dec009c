use crate::{Action, Event, Lock, LockGuard};
use std::{
    fmt,
    sync::{Arc, Mutex},
};

type Work = Box<dyn FnOnce() + Send>;

struct TaskInner {
    lock: Lock,
    work: Mutex<Option<Work>>,
}

/// A unit of work guarded by a [Lock], ready to be handed to a [Scheduler].
///
/// The work is held in a slot shared by every handle to the task. Running the task and
/// cancelling it both take the work out of the slot, so exactly one of them wins.
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a task that runs `work` under `lock`.
    pub fn new(lock: Lock, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                lock,
                work: Mutex::new(Some(Box::new(work))),
            }),
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.inner.lock
    }

    /// Returns `true` once the task has been cancelled or has run.
    pub fn is_cancelled(&self) -> bool {
        self.inner.work.lock().unwrap().is_none()
    }

    /// Acquire the task's lock (blocking) and run it.
    ///
    /// Returns `false` if the task was cancelled first.
    pub fn run(self) -> bool {
        let guard = self.inner.lock.lock();
        self.run_locked(guard)
    }

    /// Run the task under a guard of its lock, acquired by the caller.
    pub(crate) fn run_locked(self, guard: LockGuard) -> bool {
        debug_assert!(guard.lock() == &self.inner.lock);
        let work = self.inner.work.lock().unwrap().take();
        match work {
            Some(work) => {
                work();
                drop(guard);
                true
            }
            None => false,
        }
    }

    /// Acquire the task's lock if it is free.
    pub(crate) fn try_acquire(&self) -> Option<LockGuard> {
        self.inner.lock.try_lock()
    }

    /// Another handle to the same task.
    pub(crate) fn share(&self) -> Task {
        Task {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn same(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Prevent the task from running.
    ///
    /// Returns `true` if this call removed the work (it had neither run nor been cancelled).
    pub(crate) fn cancel(&self) -> bool {
        let work = self.inner.work.lock().unwrap().take();
        work.is_some()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("lock", &self.inner.lock)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Enqueue [Task]s for later, possibly cross-thread, execution.
pub trait Scheduler: Send + Sync {
    /// Enqueue `task`. It runs at most once, with its lock held.
    fn submit(&self, task: Task);

    /// Enqueue `task` and return an [Action] that cancels it.
    fn schedule(&self, task: Task) -> Action {
        let handle = task.share();
        self.submit(task);
        Action::new(move || {
            handle.cancel();
        })
    }
}

/// A one-shot closure bound to a [Scheduler] and a guarding [Lock].
///
/// Scheduling consumes the [Callback], so it runs at most once.
pub struct Callback<T> {
    scheduler: Arc<dyn Scheduler>,
    lock: Lock,
    f: Box<dyn FnOnce(T) + Send>,
}

/// A callback receiving the outcome of an asynchronous operation.
pub type EventCallback = Callback<Event>;

/// A callback receiving nothing.
pub type SimpleCallback = Callback<()>;

impl<T: Send + 'static> Callback<T> {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        lock: Lock,
        f: impl FnOnce(T) + Send + 'static,
    ) -> Self {
        Self {
            scheduler,
            lock,
            f: Box::new(f),
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Schedule the callback with `param`.
    pub fn schedule(self, param: T) -> Action {
        let Self { scheduler, lock, f } = self;
        scheduler.schedule(Task::new(lock, move || f(param)))
    }

    /// Convert into a [Task] that calls the callback with `param`, bound to the same lock.
    pub fn into_task(self, param: T) -> (Arc<dyn Scheduler>, Task) {
        let Self { scheduler, lock, f } = self;
        (scheduler, Task::new(lock, move || f(param)))
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("lock", &self.lock).finish()
    }
}

enum State<T> {
    Parked(Callback<T>),
    Scheduled(Action),
    Released,
}

/// A [Callback] parked until the result it is waiting for is ready.
///
/// This is the building block for operations that complete later: the operation keeps the
/// [Pending] and hands the requester the [Action] returned by [Pending::new]. Releasing
/// that [Action] before the operation completes drops the callback; releasing it after
/// [Pending::fire] cancels the scheduled callback if it has not run yet.
pub struct Pending<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T: Send + 'static> Pending<T> {
    pub fn new(callback: Callback<T>) -> (Self, Action) {
        let state = Arc::new(Mutex::new(State::Parked(callback)));
        let action = Action::new({
            let state = state.clone();
            move || {
                let previous = std::mem::replace(&mut *state.lock().unwrap(), State::Released);
                // Release outside of the state lock
                drop(previous);
            }
        });
        (Self { state }, action)
    }

    /// Schedule the parked callback with `value`.
    ///
    /// Returns the value back if the requester already released its [Action].
    pub fn fire(self, value: T) -> Result<(), T> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Released) {
            State::Parked(callback) => {
                *state = State::Scheduled(callback.schedule(value));
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Returns `true` if the requester released its [Action] before the result was ready.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Released)
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock().unwrap() {
            State::Parked(_) => "parked",
            State::Scheduled(_) => "scheduled",
            State::Released => "released",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}
