use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatcher counters, updated lock-free from any thread.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
    consumer_errors: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    /// Events handed to consumers.
    pub dispatched: u64,
    /// Events that had no interested consumer.
    pub skipped: u64,
    /// Events whose final state was cancelled.
    pub cancelled: u64,
    pub timed_out: u64,
    pub abandoned: u64,
    pub consumer_errors: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            consumer_errors: self.consumer_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_consumer_errors(&self, count: usize) {
        if count > 0 {
            self.consumer_errors
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }
}
