use crate::{Action, Callback, Lock, Scheduler, Task};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// An in-process FIFO of [Task]s, run by whoever calls [CallbackQueue::drain].
///
/// A [CallbackQueue] never runs anything on its own. It backs the interest lists of
/// [crate::EventSystem] (drained synchronously at stop and reload), the deadlines of
/// [crate::TimeoutThread] (forwarded to a runner when due), and deterministic tests that
/// step callbacks by hand.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct CallbackQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a [Callback] that is scheduled onto this queue.
    pub fn callback<T: Send + 'static>(
        &self,
        lock: Lock,
        f: impl FnOnce(T) + Send + 'static,
    ) -> Callback<T> {
        Callback::new(Arc::new(self.clone()), lock, f)
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Run queued tasks in FIFO order until the queue is empty.
    ///
    /// Tasks scheduled onto this queue while draining (including by the tasks themselves)
    /// are run by the same call. Each task runs with its lock held, blocking until the lock
    /// is free. Returns the number of tasks that ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(task) = self.pop() else {
                return ran;
            };
            if task.run() {
                ran += 1;
            }
        }
    }

    /// Run at most one queued task. Returns `false` if the queue was empty.
    pub fn step(&self) -> bool {
        match self.pop() {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Hand every queued task to `target`, preserving order.
    ///
    /// Actions returned when the tasks were scheduled here still cancel them.
    pub fn forward(&self, target: &dyn Scheduler) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let count = tasks.len();
        for task in tasks {
            target.submit(task);
        }
        count
    }

    fn pop(&self) -> Option<Task> {
        self.tasks.lock().unwrap().pop_front()
    }
}

impl Scheduler for CallbackQueue {
    fn submit(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
    }

    /// Cancelling the returned [Action] also removes the task from the queue.
    fn schedule(&self, task: Task) -> Action {
        let handle = task.share();
        self.submit(task);
        let tasks = Arc::downgrade(&self.tasks);
        Action::new(move || {
            if !handle.cancel() {
                return;
            }
            if let Some(tasks) = tasks.upgrade() {
                tasks.lock().unwrap().retain(|task| !task.same(&handle));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fifo() {
        let queue = CallbackQueue::new();
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();
        let mut actions = Vec::new();
        for i in 0..5 {
            let sender = sender.clone();
            let callback = queue.callback(lock.clone(), move |_: ()| sender.send(i).unwrap());
            actions.push(callback.schedule(()));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.drain(), 5);
        let order: Vec<_> = receiver.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel_removes_entry() {
        let queue = CallbackQueue::new();
        let lock = Lock::new("test");
        let first = queue.callback(lock.clone(), |_: ()| {}).schedule(());
        let second = queue
            .callback(lock, |_: ()| panic!("cancelled callback ran"))
            .schedule(());
        assert_eq!(queue.len(), 2);
        second.cancel();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), 1);
        first.cancel();
    }

    #[test]
    fn test_drain_reentrant() {
        let queue = CallbackQueue::new();
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();
        let _action = queue
            .callback(lock.clone(), {
                let queue = queue.clone();
                move |_: ()| {
                    sender.send("outer").unwrap();
                    // Scheduled from inside the drain; runs before drain returns
                    let sender = sender.clone();
                    queue.submit(Task::new(lock, move || sender.send("inner").unwrap()));
                }
            })
            .schedule(());
        assert_eq!(queue.drain(), 2);
        let order: Vec<_> = receiver.try_iter().collect();
        assert_eq!(order, vec!["outer", "inner"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_step() {
        let queue = CallbackQueue::new();
        let lock = Lock::new("test");
        queue.submit(Task::new(lock.clone(), || {}));
        queue.submit(Task::new(lock, || {}));
        assert!(queue.step());
        assert_eq!(queue.len(), 1);
        assert!(queue.step());
        assert!(!queue.step());
    }

    #[test]
    fn test_forward_keeps_cancellation() {
        let source = CallbackQueue::new();
        let target = CallbackQueue::new();
        let lock = Lock::new("test");
        let (sender, receiver) = mpsc::channel();
        let kept = source
            .callback(lock.clone(), {
                let sender = sender.clone();
                move |_: ()| sender.send("kept").unwrap()
            })
            .schedule(());
        let dropped = source
            .callback(lock, move |_: ()| sender.send("dropped").unwrap())
            .schedule(());

        assert_eq!(source.forward(&target), 2);
        assert!(source.is_empty());
        dropped.cancel();
        assert_eq!(target.drain(), 1);
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec!["kept"]);
        kept.cancel();
    }
}
