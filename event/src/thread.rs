use crate::{panic_message, Action, Error, Lock, LockGuard, Metrics, Scheduler, Task};
use std::{
    collections::VecDeque,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error};

struct State {
    queue: VecDeque<Task>,
    stopping: bool,
}

struct Inner {
    name: String,
    idle_wait: Duration,
    catch_panics: bool,
    metrics: Metrics,
    state: Mutex<State>,
    wake: Condvar,
}

/// Remove the oldest task that can run now.
///
/// Once a task is found blocked on its lock, younger tasks on the same lock are skipped for
/// the rest of the pass, even if the lock is released meanwhile.
fn pick(
    queue: &mut VecDeque<Task>,
    mut acquire: impl FnMut(&Task) -> Option<LockGuard>,
) -> Option<(Task, LockGuard)> {
    let mut blocked: Vec<Lock> = Vec::new();
    let mut index = 0;
    while index < queue.len() {
        if queue[index].is_cancelled() {
            queue.remove(index);
            continue;
        }
        if blocked.contains(queue[index].lock()) {
            index += 1;
            continue;
        }
        match acquire(&queue[index]) {
            Some(guard) => {
                let task = queue.remove(index).expect("index checked above");
                return Some((task, guard));
            }
            None => {
                blocked.push(queue[index].lock().clone());
                index += 1;
            }
        }
    }
    None
}

enum Next {
    Run(Task, LockGuard),
    Blocked,
    Exit,
}

impl Inner {
    /// Pick the oldest task whose lock is free.
    fn next(&self) -> Next {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.queue.is_empty() {
                if state.stopping {
                    return Next::Exit;
                }
                state = self.wake.wait(state).unwrap();
                continue;
            }
            if let Some((task, guard)) = pick(&mut state.queue, Task::try_acquire) {
                return Next::Run(task, guard);
            }
            if state.queue.is_empty() {
                continue;
            }
            return Next::Blocked;
        }
    }

    fn wait_idle(&self) {
        let state = self.state.lock().unwrap();
        let _ = self.wake.wait_timeout(state, self.idle_wait).unwrap();
    }

    fn run(&self) {
        debug!(name = self.name, "callback thread started");
        loop {
            match self.next() {
                Next::Run(task, guard) => {
                    let result = catch_unwind(AssertUnwindSafe(|| task.run_locked(guard)));
                    match result {
                        Ok(true) => {
                            self.metrics.executed.inc();
                        }
                        Ok(false) => {}
                        Err(panic) => {
                            let err = panic_message(&*panic);
                            error!(name = self.name, ?err, "callback panicked");
                            if !self.catch_panics {
                                resume_unwind(panic);
                            }
                        }
                    }
                }
                Next::Blocked => self.wait_idle(),
                Next::Exit => break,
            }
        }
        debug!(name = self.name, "callback thread exited");
    }
}

/// A named thread that runs scheduled [Task]s in FIFO order.
///
/// Before running a task, the thread tries to acquire the task's lock. Tasks whose lock is
/// held elsewhere are skipped (keeping their place in line) in favor of the next task whose
/// lock is free, so callbacks sharing a lock run in submission order while unrelated
/// callbacks are not blocked behind them. When every queued task is blocked, the thread
/// retries after the configured idle wait.
pub struct CallbackThread {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackThread {
    pub fn new(
        name: impl Into<String>,
        idle_wait: Duration,
        catch_panics: bool,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                idle_wait,
                catch_panics,
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

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread was already started.
    pub fn start(&self) -> Result<(), Error> {
        let mut handle = self.handle.lock().unwrap();
        assert!(handle.is_none(), "callback thread already started");
        let inner = self.inner.clone();
        *handle = Some(
            thread::Builder::new()
                .name(self.inner.name.clone())
                .spawn(move || inner.run())?,
        );
        Ok(())
    }

    /// Ask the thread to exit once its queue is empty.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stopping = true;
        self.inner.wake.notify_all();
    }

    /// Wait for the thread to exit.
    ///
    /// A panic that escaped a callback is resumed on the caller.
    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                resume_unwind(panic);
            }
        }
    }

    /// Returns the number of queued tasks (including cancelled tasks not yet reaped).
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Scheduler for CallbackThread {
    fn submit(&self, task: Task) {
        let mut state = self.inner.state.lock().unwrap();
        state.queue.push_back(task);
        self.inner.metrics.scheduled.inc();
        self.inner.wake.notify_one();
    }

    fn schedule(&self, task: Task) -> Action {
        let handle = task.share();
        self.submit(task);
        let cancelled = self.inner.metrics.cancelled.clone();
        Action::new(move || {
            if handle.cancel() {
                cancelled.inc();
            }
        })
    }
}

/// Extra [CallbackThread]s for spreading work, scheduled round-robin.
pub struct WorkerPool {
    workers: Vec<Arc<CallbackThread>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create `count` workers named `{prefix}-worker-{i}`.
    pub fn new(
        prefix: &str,
        count: usize,
        idle_wait: Duration,
        catch_panics: bool,
        metrics: Metrics,
    ) -> Self {
        let workers = (0..count)
            .map(|i| {
                Arc::new(CallbackThread::new(
                    format!("{prefix}-worker-{i}"),
                    idle_wait,
                    catch_panics,
                    metrics.clone(),
                ))
            })
            .collect();
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the `index`th worker.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn worker(&self, index: usize) -> Arc<CallbackThread> {
        assert!(
            index < self.workers.len(),
            "worker {} out of range ({} workers)",
            index,
            self.workers.len()
        );
        self.workers[index].clone()
    }

    pub fn start(&self) -> Result<(), Error> {
        for worker in self.workers.iter() {
            worker.start()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        for worker in self.workers.iter() {
            worker.stop();
        }
    }

    pub fn join(&self) {
        for worker in self.workers.iter() {
            worker.join();
        }
    }
}

impl Scheduler for WorkerPool {
    /// # Panics
    ///
    /// Panics if the pool has no workers.
    fn submit(&self, task: Task) {
        assert!(!self.workers.is_empty(), "worker pool is empty");
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].submit(task);
    }

    fn schedule(&self, task: Task) -> Action {
        assert!(!self.workers.is_empty(), "worker pool is empty");
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].schedule(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Lock;
    use std::{sync::mpsc, time::Instant};
    use wanproxy_macros::test_traced;

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn(name: &str) -> CallbackThread {
        let runner = CallbackThread::new(name, Duration::from_millis(1), false, Metrics::default());
        runner.start().unwrap();
        runner
    }

    #[test_traced]
    fn test_runs_in_order() {
        let runner = spawn("test-order");
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();
        let mut actions = Vec::new();
        for i in 0..100 {
            let sender = sender.clone();
            let task = Task::new(lock.clone(), move || sender.send(i).unwrap());
            actions.push(runner.schedule(task));
        }
        let order: Vec<_> = (0..100).map(|_| receiver.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
        runner.stop();
        runner.join();
    }

    #[test_traced]
    fn test_skips_held_lock() {
        let runner = spawn("test-skip");
        let busy = Lock::new("busy");
        let free = Lock::new("free");
        let (sender, receiver) = mpsc::channel();

        let guard = busy.lock();
        let _blocked = runner.schedule(Task::new(busy.clone(), {
            let sender = sender.clone();
            move || sender.send("blocked").unwrap()
        }));
        let _free = runner.schedule(Task::new(free, move || sender.send("free").unwrap()));

        // The free task overtakes the blocked one
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "free");
        assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());
        drop(guard);
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "blocked");

        runner.stop();
        runner.join();
    }

    #[test_traced]
    fn test_pick_keeps_order_within_lock() {
        let shared = Lock::new("shared");
        let other = Lock::new("other");
        let (sender, receiver) = mpsc::channel();
        let mut queue = VecDeque::new();
        for (lock, label) in [(&shared, "first"), (&other, "unrelated"), (&shared, "second")] {
            let sender = sender.clone();
            queue.push_back(Task::new(lock.clone(), move || sender.send(label).unwrap()));
        }

        // The shared lock is busy when the first task is checked and free by the time the
        // scan reaches the second one
        let mut busy_once = true;
        let (task, guard) = pick(&mut queue, |task| {
            if busy_once && task.lock() == &shared {
                busy_once = false;
                return None;
            }
            task.try_acquire()
        })
        .unwrap();
        assert!(task.run_locked(guard));
        assert_eq!(receiver.try_recv().unwrap(), "unrelated");

        while let Some((task, guard)) = pick(&mut queue, Task::try_acquire) {
            assert!(task.run_locked(guard));
        }
        let rest: Vec<_> = receiver.try_iter().collect();
        assert_eq!(rest, vec!["first", "second"]);
        assert!(queue.is_empty());
    }

    #[test_traced]
    fn test_cancel_before_run() {
        let runner = spawn("test-cancel");
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();

        // Hold the lock so that the task cannot run before it is cancelled
        let guard = lock.lock();
        let action = runner.schedule(Task::new(lock.clone(), {
            let sender = sender.clone();
            move || sender.send("cancelled").unwrap()
        }));
        action.cancel();
        drop(guard);
        let _action = runner.schedule(Task::new(lock, move || sender.send("ran").unwrap()));
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "ran");
        assert!(receiver.try_recv().is_err());

        runner.stop();
        runner.join();
    }

    #[test_traced]
    fn test_stop_finishes_queue() {
        let runner = spawn("test-stop");
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();
        let guard = lock.lock();
        let mut actions = Vec::new();
        for i in 0..10 {
            let sender = sender.clone();
            let task = Task::new(lock.clone(), move || sender.send(i).unwrap());
            actions.push(runner.schedule(task));
        }
        runner.stop();
        drop(guard);
        runner.join();
        assert_eq!(receiver.try_iter().count(), 10);
        assert!(runner.is_empty());
    }

    #[test_traced]
    fn test_catch_panics() {
        let runner = CallbackThread::new(
            "test-catch",
            Duration::from_millis(1),
            true,
            Metrics::default(),
        );
        runner.start().unwrap();
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();
        let _panics = runner.schedule(Task::new(lock.clone(), || panic!("boom")));
        let _after = runner.schedule(Task::new(lock, move || sender.send(()).unwrap()));
        receiver.recv_timeout(WAIT).unwrap();
        runner.stop();
        runner.join();
    }

    #[test_traced]
    #[should_panic(expected = "boom")]
    fn test_panic_resumed_on_join() {
        let runner = spawn("test-panic");
        let _action = runner.schedule(Task::new(Lock::new("test"), || panic!("boom")));
        let start = Instant::now();
        while !runner.is_empty() && start.elapsed() < WAIT {
            thread::sleep(Duration::from_millis(1));
        }
        runner.stop();
        runner.join();
    }

    #[test_traced]
    fn test_worker_pool_round_robin() {
        let pool = WorkerPool::new("test", 3, Duration::from_millis(1), false, Metrics::default());
        pool.start().unwrap();
        let (sender, receiver) = mpsc::channel();
        let mut actions = Vec::new();
        for _ in 0..6 {
            let sender = sender.clone();
            actions.push(pool.schedule(Task::new(Lock::new("test"), move || {
                let name = thread::current().name().map(str::to_string);
                sender.send(name.unwrap()).unwrap();
            })));
        }
        let mut names: Vec<_> = (0..6).map(|_| receiver.recv_timeout(WAIT).unwrap()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "test-worker-0",
                "test-worker-0",
                "test-worker-1",
                "test-worker-1",
                "test-worker-2",
                "test-worker-2",
            ]
        );
        assert_eq!(pool.worker(1).name(), "test-worker-1");
        pool.stop();
        pool.join();
    }

    #[test]
    #[should_panic(expected = "worker pool is empty")]
    fn test_empty_pool() {
        let pool = WorkerPool::new("test", 0, Duration::from_millis(1), false, Metrics::default());
        pool.submit(Task::new(Lock::new("test"), || {}));
    }
}
