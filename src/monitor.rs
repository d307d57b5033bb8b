//! Deadlock Monitor
//!
//! Counters for observed conflicts and retry outcomes. All counters sit
//! behind one mutex so [`DeadlockMonitor::statistics`] is a consistent
//! point-in-time copy, not a live view.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    deadlock_count: u64,
    last_deadlock: Option<DateTime<Utc>>,
    total_retries: u64,
    successful_retries: u64,
}

/// Shared conflict/retry statistics. Safe for concurrent use.
#[derive(Debug, Default)]
pub struct DeadlockMonitor {
    counters: Mutex<Counters>,
}

impl DeadlockMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    // Bookkeeping must never fail the caller, so a poisoned lock is recovered.
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one conflict classification
    pub fn record_deadlock(&self) {
        let mut c = self.counters();
        c.deadlock_count += 1;
        c.last_deadlock = Some(Utc::now());
    }

    /// Record the outcome of one retry attempt (any attempt after the first)
    pub fn record_retry(&self, success: bool) {
        let mut c = self.counters();
        c.total_retries += 1;
        if success {
            c.successful_retries += 1;
        }
    }

    /// Snapshot of all counters
    pub fn statistics(&self) -> DeadlockStatistics {
        let c = self.counters();
        let retry_success_rate = if c.total_retries == 0 {
            0.0
        } else {
            c.successful_retries as f64 / c.total_retries as f64
        };
        DeadlockStatistics {
            deadlock_count: c.deadlock_count,
            last_deadlock: c.last_deadlock,
            total_retries: c.total_retries,
            successful_retries: c.successful_retries,
            retry_success_rate,
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        *self.counters() = Counters::default();
    }
}

/// Immutable snapshot of monitor counters (for reporting)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadlockStatistics {
    pub deadlock_count: u64,
    pub last_deadlock: Option<DateTime<Utc>>,
    pub total_retries: u64,
    pub successful_retries: u64,
    /// `successful_retries / total_retries`, 0 when nothing was retried
    pub retry_success_rate: f64,
}

impl std::fmt::Display for DeadlockStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Deadlock Stats: deadlocks={}, retries={} (successful={}, rate={:.2}), last_deadlock={}",
            self.deadlock_count,
            self.total_retries,
            self.successful_retries,
            self.retry_success_rate,
            self.last_deadlock
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        )
    }
}
