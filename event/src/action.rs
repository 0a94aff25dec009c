use std::fmt;

/// The release token for one outstanding asynchronous operation.
///
/// An [Action] is consumed exactly once, either by [Action::cancel] or by being dropped
/// (both release the operation the same way). If the operation's callback has not run
/// yet, it never will. If it already ran, releasing the [Action] is a no-op. Because
/// cancellation takes the [Action] by value, cancelling twice is unrepresentable.
///
/// Cancellation is synchronous: once [Action::cancel] returns, any state the operation
/// held (queued callbacks, registrations, sub-operations) has been released. When the
/// caller holds the callback's [crate::Lock] while cancelling, the callback is
/// guaranteed not to be running concurrently.
#[must_use = "dropping an action cancels the operation"]
pub struct Action {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Action {
    /// Create an [Action] that runs `cancel` when released.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Create an [Action] with nothing to release.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Release the operation.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Merge two actions into one that releases both, `self` first.
    pub fn join(self, other: Action) -> Action {
        Action::new(move || {
            self.cancel();
            other.cancel();
        })
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Action {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("pending", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting() -> (Arc<AtomicUsize>, Action) {
        let count = Arc::new(AtomicUsize::new(0));
        let action = Action::new({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, action)
    }

    #[test]
    fn test_cancel_runs_once() {
        let (count, action) = counting();
        action.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_cancels() {
        let (count, action) = counting();
        drop(action);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join() {
        let (first, a) = counting();
        let (second, b) = counting();
        let joined = a.join(b);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        joined.cancel();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop() {
        Action::noop().cancel();
    }
}
