use prometheus_client::{metrics::counter::Counter, registry::Registry};

/// Counters describing the work driven by an [crate::EventSystem].
///
/// Counters exist (and count) whether or not they are registered. Clones share the same
/// underlying values.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub scheduled: Counter,
    pub executed: Counter,
    pub cancelled: Counter,
    pub timeouts: Counter,
    pub polls: Counter,
    pub destroys: Counter,
}

impl Metrics {
    /// Register every counter with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "callbacks_scheduled",
            "Total number of callbacks scheduled",
            self.scheduled.clone(),
        );
        registry.register(
            "callbacks_executed",
            "Total number of callbacks executed",
            self.executed.clone(),
        );
        registry.register(
            "callbacks_cancelled",
            "Total number of callbacks cancelled before running",
            self.cancelled.clone(),
        );
        registry.register(
            "timeouts_armed",
            "Total number of timeouts armed",
            self.timeouts.clone(),
        );
        registry.register(
            "poll_registrations",
            "Total number of readiness registrations",
            self.polls.clone(),
        );
        registry.register(
            "deferred_destroys",
            "Total number of objects destroyed on the destroy thread",
            self.destroys.clone(),
        );
    }
}
