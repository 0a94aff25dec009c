use std::{
    fmt,
    sync::{Arc, Condvar, Mutex},
};

struct Inner {
    name: String,
    held: Mutex<bool>,
    released: Condvar,
}

/// A named mutual-exclusion token guarding the callbacks of one object.
///
/// Every callback runs while its [Lock] is held, so callbacks sharing a [Lock] never run
/// concurrently. Clones refer to the same lock.
///
/// The lock is not re-entrant: acquiring it again from a callback that is already running
/// under it deadlocks.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<Inner>,
}

impl Lock {
    /// Create an unheld lock. `name` only appears in diagnostics.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                held: Mutex::new(false),
                released: Condvar::new(),
            }),
        }
    }

    /// Returns the name given at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> LockGuard {
        let mut held = self.inner.held.lock().unwrap();
        while *held {
            held = self.inner.released.wait(held).unwrap();
        }
        *held = true;
        LockGuard { lock: self.clone() }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<LockGuard> {
        let mut held = self.inner.held.lock().unwrap();
        if *held {
            return None;
        }
        *held = true;
        Some(LockGuard { lock: self.clone() })
    }

    /// Returns `true` if some guard currently holds the lock.
    pub fn is_held(&self) -> bool {
        *self.inner.held.lock().unwrap()
    }

    fn unlock(&self) {
        let mut held = self.inner.held.lock().unwrap();
        *held = false;
        self.inner.released.notify_one();
    }
}

impl PartialEq for Lock {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Lock {}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lock").field(&self.inner.name).finish()
    }
}

/// Releases its [Lock] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: Lock,
}

impl LockGuard {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn test_try_lock() {
        let lock = Lock::new("test");
        let guard = lock.try_lock().unwrap();
        assert!(lock.is_held());
        assert!(lock.clone().try_lock().is_none());
        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_lock_waits_for_release() {
        let lock = Lock::new("test");
        let guard = lock.lock();

        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn({
            let lock = lock.clone();
            move || {
                let _guard = lock.lock();
                sender.send(()).unwrap();
            }
        });
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard);
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_identity() {
        let a = Lock::new("same");
        let b = Lock::new("same");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.name(), "same");
    }
}
