use crate::{
    Action, Callback, CallbackQueue, CallbackThread, DestroyThread, Error, Lock, Metrics,
    Scheduler, Task, TimeoutThread, WorkerPool,
};
use prometheus_client::registry::Registry;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use crate::{EventCallback, EventPoll, PollType};
        use std::os::fd::RawFd;
    }
}

/// Configuration for an [EventSystem].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of extra callback threads available through [EventSystem::worker].
    pub workers: usize,

    /// Whether to start the readiness poller.
    ///
    /// Ignored on platforms without `poll(2)`.
    pub poll: bool,

    /// Whether a panicking callback should be logged and skipped instead of taking down
    /// the thread that ran it.
    pub catch_panics: bool,

    /// How long a callback thread waits before retrying when every queued callback is
    /// blocked on a lock held elsewhere.
    pub idle_wait: Duration,

    /// Prefix of every thread name.
    pub thread_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            poll: true,
            catch_panics: false,
            idle_wait: Duration::from_millis(1),
            thread_prefix: "event".to_string(),
        }
    }
}

/// Broadcast hooks registered with [EventSystem::register_interest].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Run (synchronously) by [EventSystem::stop].
    Stop,
    /// Run (synchronously) by [EventSystem::reload].
    Reload,
}

/// The threads that drive callbacks, composed into one explicitly constructed context.
///
/// Construct one with [EventSystem::new], share it (usually behind an [Arc]) with the
/// components that schedule work, call [EventSystem::start], and tear it down with
/// [EventSystem::stop] followed by [EventSystem::join].
pub struct EventSystem {
    metrics: Metrics,
    callbacks: Arc<CallbackThread>,
    workers: WorkerPool,
    timeouts: TimeoutThread,
    #[cfg(unix)]
    poller: Option<EventPoll>,
    destroyer: DestroyThread,
    interests: Mutex<HashMap<Interest, CallbackQueue>>,
}

impl EventSystem {
    pub fn new(config: Config) -> Result<Self, Error> {
        let prefix = &config.thread_prefix;
        let metrics = Metrics::default();
        let callbacks = Arc::new(CallbackThread::new(
            format!("{prefix}-callback"),
            config.idle_wait,
            config.catch_panics,
            metrics.clone(),
        ));
        let workers = WorkerPool::new(
            prefix,
            config.workers,
            config.idle_wait,
            config.catch_panics,
            metrics.clone(),
        );
        let timeouts = TimeoutThread::new(
            format!("{prefix}-timeout"),
            callbacks.clone(),
            metrics.clone(),
        );
        #[cfg(unix)]
        let poller = if config.poll {
            Some(EventPoll::new(format!("{prefix}-poll"), metrics.clone())?)
        } else {
            None
        };
        let destroyer = DestroyThread::new(format!("{prefix}-destroy"), metrics.clone());
        Ok(Self {
            metrics,
            callbacks,
            workers,
            timeouts,
            #[cfg(unix)]
            poller,
            destroyer,
            interests: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn every thread.
    pub fn start(&self) -> Result<(), Error> {
        self.callbacks.start()?;
        self.workers.start()?;
        self.timeouts.start()?;
        #[cfg(unix)]
        if let Some(poller) = &self.poller {
            poller.start()?;
        }
        self.destroyer.start()?;
        debug!(workers = self.workers.len(), "event system started");
        Ok(())
    }

    /// Returns the default scheduler (the default callback thread).
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.callbacks.clone()
    }

    /// Create a [Callback] bound to the default scheduler.
    pub fn callback<T: Send + 'static>(
        &self,
        lock: Lock,
        f: impl FnOnce(T) + Send + 'static,
    ) -> Callback<T> {
        Callback::new(self.scheduler(), lock, f)
    }

    /// Run `task` on the default callback thread once `delay` has elapsed.
    pub fn timeout(&self, delay: Duration, task: Task) -> Action {
        self.timeouts.timeout(delay, task)
    }

    /// Deliver readiness of `fd` to `callback`.
    ///
    /// # Panics
    ///
    /// Panics if the poller was disabled in [Config] or if `(fd, kind)` is already
    /// registered.
    #[cfg(unix)]
    pub fn poll(&self, kind: PollType, fd: RawFd, callback: EventCallback) -> Action {
        let poller = self.poller.as_ref().expect("event poller disabled");
        poller.poll(kind, fd, callback)
    }

    /// Register `task` to run when `interest` is broadcast.
    ///
    /// Hooks run once: a hook that wants to observe the next broadcast registers again.
    pub fn register_interest(&self, interest: Interest, task: Task) -> Action {
        let queue = self
            .interests
            .lock()
            .unwrap()
            .entry(interest)
            .or_default()
            .clone();
        queue.schedule(task)
    }

    /// Run every [Interest::Reload] hook on the calling thread.
    ///
    /// Hooks registered while reloading wait for the next reload. Returns the number of
    /// hooks that ran.
    pub fn reload(&self) -> usize {
        let queue = self
            .interests
            .lock()
            .unwrap()
            .insert(Interest::Reload, CallbackQueue::new());
        let ran = queue.map_or(0, |queue| queue.drain());
        debug!(ran, "reload hooks finished");
        ran
    }

    /// Drop `object` on the destroy thread while holding `lock`.
    pub fn destroy<T: Send + 'static>(&self, lock: Lock, object: T) {
        self.destroyer.destroy(lock, object);
    }

    /// Run every [Interest::Stop] hook on the calling thread, then ask every thread to exit
    /// once its in-flight work is finished.
    pub fn stop(&self) {
        let queue = self
            .interests
            .lock()
            .unwrap()
            .get(&Interest::Stop)
            .cloned();
        if let Some(queue) = queue {
            let registered = queue.len();
            let ran = queue.drain();
            if ran > registered {
                warn!(registered, ran, "stop hooks registered more stop hooks");
            }
        }

        #[cfg(unix)]
        if let Some(poller) = &self.poller {
            poller.stop();
        }
        self.timeouts.stop();
        self.workers.stop();
        self.callbacks.stop();
        self.destroyer.stop();
    }

    /// Wait for every thread to exit.
    pub fn join(&self) {
        #[cfg(unix)]
        if let Some(poller) = &self.poller {
            poller.join();
        }
        self.timeouts.join();
        self.workers.join();
        self.callbacks.join();
        self.destroyer.join();
        debug!("event system stopped");
    }

    /// Register the system's counters with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Returns the `index`th extra callback thread.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [EventSystem::workers].
    pub fn worker(&self, index: usize) -> Arc<dyn Scheduler> {
        self.workers.worker(index)
    }

    /// Returns the number of extra callback threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl Scheduler for EventSystem {
    fn submit(&self, task: Task) {
        self.callbacks.submit(task);
    }

    fn schedule(&self, task: Task) -> Action {
        self.callbacks.schedule(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;
    use prometheus_client::encoding::text::encode;
    use std::{sync::mpsc, thread};
    use wanproxy_macros::test_traced;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> Config {
        Config {
            thread_prefix: "test".to_string(),
            ..Default::default()
        }
    }

    fn started(config: Config) -> Arc<EventSystem> {
        let system = Arc::new(EventSystem::new(config).unwrap());
        system.start().unwrap();
        system
    }

    fn shutdown(system: &EventSystem) {
        system.stop();
        system.join();
    }

    fn current_thread() -> String {
        thread::current().name().unwrap_or_default().to_string()
    }

    #[test_traced]
    fn test_callback_runs_on_default_thread() {
        let system = started(config());
        let (sender, receiver) = mpsc::channel();
        let callback = system.callback(Lock::new("test"), move |event: Event| {
            sender.send((event, current_thread())).unwrap();
        });
        let _action = callback.schedule(Event::eos());
        let (event, name) = receiver.recv_timeout(WAIT).unwrap();
        assert_eq!(event, Event::eos());
        assert_eq!(name, "test-callback");
        shutdown(&system);
    }

    #[test_traced]
    fn test_timeout_runs_on_default_thread() {
        let system = started(config());
        let (sender, receiver) = mpsc::channel();
        let task = Task::new(Lock::new("test"), move || sender.send(current_thread()).unwrap());
        let _action = system.timeout(Duration::from_millis(5), task);
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "test-callback");
        shutdown(&system);
    }

    #[test_traced]
    fn test_cancelled_timeout_never_runs() {
        let system = started(config());
        let action = system.timeout(
            Duration::from_millis(10),
            Task::new(Lock::new("test"), || panic!("cancelled timeout ran")),
        );
        action.cancel();
        thread::sleep(Duration::from_millis(30));
        shutdown(&system);
    }

    #[test_traced]
    fn test_workers() {
        let system = started(Config {
            workers: 2,
            ..config()
        });
        assert_eq!(system.workers(), 2);
        let (sender, receiver) = mpsc::channel();
        let worker = system.worker(1);
        let _action = worker.schedule(Task::new(Lock::new("test"), move || {
            sender.send(current_thread()).unwrap()
        }));
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "test-worker-1");
        shutdown(&system);
    }

    #[test_traced]
    fn test_stop_runs_hooks() {
        let system = started(config());
        let (sender, receiver) = mpsc::channel();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let _first = system.register_interest(Interest::Stop, {
            let system = system.clone();
            let sender = sender.clone();
            let nested = nested.clone();
            Task::new(Lock::new("first"), move || {
                sender.send("first").unwrap();

                // Tolerated, and run by the same stop
                let action = system.register_interest(
                    Interest::Stop,
                    Task::new(Lock::new("nested"), move || sender.send("nested").unwrap()),
                );
                nested.lock().unwrap().push(action);
            })
        });
        let cancelled = system.register_interest(
            Interest::Stop,
            Task::new(Lock::new("cancelled"), || panic!("cancelled hook ran")),
        );
        cancelled.cancel();

        shutdown(&system);
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec!["first", "nested"]);
    }

    #[test_traced]
    fn test_reload_runs_hooks_once() {
        let system = started(config());
        let (sender, receiver) = mpsc::channel();
        let _hook = system.register_interest(
            Interest::Reload,
            Task::new(Lock::new("hook"), move || sender.send(()).unwrap()),
        );
        assert_eq!(system.reload(), 1);
        assert_eq!(system.reload(), 0);
        assert_eq!(receiver.try_iter().count(), 1);
        shutdown(&system);
    }

    #[test_traced]
    fn test_reload_hook_rearms() {
        type Armed = Arc<Mutex<Vec<Action>>>;

        fn arm(system: Arc<EventSystem>, sender: mpsc::Sender<()>, armed: Armed) {
            let hook = Task::new(Lock::new("hook"), {
                let system = system.clone();
                let armed = armed.clone();
                move || {
                    sender.send(()).unwrap();
                    arm(system, sender, armed);
                }
            });
            let action = system.register_interest(Interest::Reload, hook);
            armed.lock().unwrap().push(action);
        }

        let system = started(config());
        let (sender, receiver) = mpsc::channel();
        let armed: Armed = Arc::new(Mutex::new(Vec::new()));
        arm(system.clone(), sender, armed.clone());
        for _ in 0..3 {
            assert_eq!(system.reload(), 1);
        }
        assert_eq!(receiver.try_iter().count(), 3);
        shutdown(&system);
    }

    #[test_traced]
    fn test_destroy() {
        struct Probe(mpsc::Sender<bool>, Lock);

        impl Drop for Probe {
            fn drop(&mut self) {
                let _ = self.0.send(self.1.is_held());
            }
        }

        let system = started(config());
        let (sender, receiver) = mpsc::channel();
        let lock = Lock::new("object");
        system.destroy(lock.clone(), Probe(sender, lock));
        assert!(receiver.recv_timeout(WAIT).unwrap());
        shutdown(&system);
    }

    #[cfg(unix)]
    #[test_traced]
    fn test_poll() {
        let system = started(config());
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let (sender, receiver) = mpsc::channel();
        let callback = system.callback(Lock::new("test"), move |event: Event| {
            sender.send(event).unwrap()
        });
        let _action = system.poll(PollType::Readable, fds[0], callback);
        unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) };
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), Event::done());

        shutdown(&system);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[cfg(unix)]
    #[test]
    #[should_panic(expected = "event poller disabled")]
    fn test_poll_disabled() {
        let system = EventSystem::new(Config {
            poll: false,
            ..config()
        })
        .unwrap();
        let callback = system.callback(Lock::new("test"), |_: Event| {});
        let _action = system.poll(PollType::Readable, 0, callback);
    }

    #[test_traced]
    fn test_metrics() {
        let system = started(config());
        let mut registry = Registry::with_prefix("event");
        system.register(&mut registry);

        let (sender, receiver) = mpsc::channel();
        let _action = system.schedule(Task::new(Lock::new("test"), move || {
            sender.send(()).unwrap()
        }));
        receiver.recv_timeout(WAIT).unwrap();
        shutdown(&system);

        let mut encoded = String::new();
        encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("event_callbacks_scheduled_total 1"));
        assert!(encoded.contains("event_callbacks_executed_total 1"));
    }
}
