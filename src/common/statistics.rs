use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock manager counters.
///
/// Updated with relaxed atomics on the hot paths; `snapshot` gives a
/// consistent-enough view for reporting.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Lock objects created.
    locks_created: AtomicU64,

    /// Lock objects removed.
    locks_removed: AtomicU64,

    /// Requests granted without waiting.
    granted_immediate: AtomicU64,

    /// Requests granted after a wait.
    granted_on_wait: AtomicU64,

    /// Requests that enqueued a wait.
    waits: AtomicU64,

    /// Waits ended by deadlock or forced rollback.
    deadlocks: AtomicU64,

    /// Waits ended by timeout.
    timeouts: AtomicU64,

    /// Waits ended by cancellation.
    cancels: AtomicU64,

    /// Grants satisfied by setting a bit in an existing lock object.
    bit_reuses: AtomicU64,

    /// Implicit locks converted to explicit.
    implicit_conversions: AtomicU64,

    /// Locks inherited across structural page changes.
    inherited: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsSnapshot {
    pub locks_created: u64,
    pub locks_removed: u64,
    pub granted_immediate: u64,
    pub granted_on_wait: u64,
    pub waits: u64,
    pub deadlocks: u64,
    pub timeouts: u64,
    pub cancels: u64,
    pub bit_reuses: u64,
    pub implicit_conversions: u64,
    pub inherited: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_created(&self) {
        self.locks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_removed(&self) {
        self.locks_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_granted_immediate(&self) {
        self.granted_immediate.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_granted_on_wait(&self) {
        self.granted_on_wait.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_waits(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_deadlocks(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_cancels(&self) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_bit_reuses(&self) {
        self.bit_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_implicit_conversions(&self) {
        self.implicit_conversions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_inherited(&self) {
        self.inherited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            locks_created: self.locks_created.load(Ordering::Relaxed),
            locks_removed: self.locks_removed.load(Ordering::Relaxed),
            granted_immediate: self.granted_immediate.load(Ordering::Relaxed),
            granted_on_wait: self.granted_on_wait.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            bit_reuses: self.bit_reuses.load(Ordering::Relaxed),
            implicit_conversions: self.implicit_conversions.load(Ordering::Relaxed),
            inherited: self.inherited.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsSnapshot {
    /// Render as pretty-printed json for logging.
    pub fn to_json(&self) -> String {
        let pretty = json!({
            "locks": {
                "created": self.locks_created,
                "removed": self.locks_removed,
                "bit reuses": self.bit_reuses,
            },
            "grants": {
                "immediate": self.granted_immediate,
                "after wait": self.granted_on_wait,
            },
            "waits": {
                "started": self.waits,
                "deadlocks": self.deadlocks,
                "timeouts": self.timeouts,
                "cancels": self.cancels,
            },
            "implicit conversions": self.implicit_conversions,
            "inherited": self.inherited,
        });
        serde_json::to_string_pretty(&pretty).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_test() {
        let stats = Statistics::new();
        stats.inc_created();
        stats.inc_created();
        stats.inc_granted_immediate();
        stats.inc_waits();
        stats.inc_deadlocks();

        let snap = stats.snapshot();
        assert_eq!(snap.locks_created, 2);
        assert_eq!(snap.granted_immediate, 1);
        assert_eq!(snap.waits, 1);
        assert_eq!(snap.deadlocks, 1);
        assert_eq!(snap.timeouts, 0);

        assert!(snap.to_json().contains("deadlocks"));
    }
}
