//! Global atomic counters for the evolution pipeline.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemon does this on every scan tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    triggers_accepted: AtomicU64,
    triggers_absorbed: AtomicU64,
    triggers_rejected: AtomicU64,
    attempts_committed: AtomicU64,
    attempts_rolled_back: AtomicU64,
    attempts_failed: AtomicU64,
    capability_invocations: AtomicU64,
    capability_failures: AtomicU64,
    knowledge_evictions: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            triggers_accepted: AtomicU64::new(0),
            triggers_absorbed: AtomicU64::new(0),
            triggers_rejected: AtomicU64::new(0),
            attempts_committed: AtomicU64::new(0),
            attempts_rolled_back: AtomicU64::new(0),
            attempts_failed: AtomicU64::new(0),
            capability_invocations: AtomicU64::new(0),
            capability_failures: AtomicU64::new(0),
            knowledge_evictions: AtomicU64::new(0),
        }
    }

    counter!(inc_triggers_accepted, triggers_accepted, triggers_accepted);
    counter!(inc_triggers_absorbed, triggers_absorbed, triggers_absorbed);
    counter!(inc_triggers_rejected, triggers_rejected, triggers_rejected);
    counter!(inc_attempts_committed, attempts_committed, attempts_committed);
    counter!(inc_attempts_rolled_back, attempts_rolled_back, attempts_rolled_back);
    counter!(inc_attempts_failed, attempts_failed, attempts_failed);
    counter!(inc_capability_invocations, capability_invocations, capability_invocations);
    counter!(inc_capability_failures, capability_failures, capability_failures);

    /// Add `n` evictions at once; a single `put` may evict several entries.
    pub fn add_knowledge_evictions(&self, n: u64) {
        if n > 0 {
            self.knowledge_evictions.fetch_add(n, Ordering::Relaxed);
            tracing::trace!(metric = "knowledge_evictions", n, "counter incremented");
        }
    }

    pub fn knowledge_evictions(&self) -> u64 {
        self.knowledge_evictions.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            triggers_accepted = self.triggers_accepted(),
            triggers_absorbed = self.triggers_absorbed(),
            triggers_rejected = self.triggers_rejected(),
            attempts_committed = self.attempts_committed(),
            attempts_rolled_back = self.attempts_rolled_back(),
            attempts_failed = self.attempts_failed(),
            capability_invocations = self.capability_invocations(),
            capability_failures = self.capability_failures(),
            knowledge_evictions = self.knowledge_evictions(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.triggers_accepted,
            &self.triggers_absorbed,
            &self.triggers_rejected,
            &self.attempts_committed,
            &self.attempts_rolled_back,
            &self.attempts_failed,
            &self.capability_invocations,
            &self.capability_failures,
            &self.knowledge_evictions,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.attempts_committed(), 0);
        m.inc_attempts_committed();
        m.inc_attempts_committed();
        assert_eq!(m.attempts_committed(), 2);

        m.inc_triggers_absorbed();
        assert_eq!(m.triggers_absorbed(), 1);

        m.add_knowledge_evictions(3);
        m.add_knowledge_evictions(0);
        assert_eq!(m.knowledge_evictions(), 3);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_triggers_accepted();
        m.inc_capability_failures();
        m.add_knowledge_evictions(2);
        m.reset();
        assert_eq!(m.triggers_accepted(), 0);
        assert_eq!(m.capability_failures(), 0);
        assert_eq!(m.knowledge_evictions(), 0);
    }
}
