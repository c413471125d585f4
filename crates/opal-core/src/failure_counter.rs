use std::sync::atomic::{AtomicU64, Ordering};

/// Public struct `FailureCounterSnapshot` used across Opal components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounterSnapshot {
    pub handled_failures: u64,
    pub soft_resets: u64,
}

/// Counts handled failures and signals a soft reset when a threshold trips.
///
/// Handled failures never abort dispatch; past the threshold the owner is
/// expected to clear transient caches and continue. The counter rearms after
/// each trip.
#[derive(Debug)]
pub struct FailureCounter {
    threshold: u64,
    since_reset: AtomicU64,
    total: AtomicU64,
    soft_resets: AtomicU64,
}

impl FailureCounter {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            since_reset: AtomicU64::new(0),
            total: AtomicU64::new(0),
            soft_resets: AtomicU64::new(0),
        }
    }

    /// Records one handled failure; returns true when the threshold trips
    /// and the caller should perform a soft reset.
    pub fn record_failure(&self) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);
        let since = self.since_reset.fetch_add(1, Ordering::SeqCst) + 1;
        if since >= self.threshold {
            self.since_reset.store(0, Ordering::SeqCst);
            self.soft_resets.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> FailureCounterSnapshot {
        FailureCounterSnapshot {
            handled_failures: self.total.load(Ordering::Relaxed),
            soft_resets: self.soft_resets.load(Ordering::Relaxed),
        }
    }
}
