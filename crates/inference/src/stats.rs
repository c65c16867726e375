//! Execution counters shared by the executor and the retry layer

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated on the execution hot path
#[derive(Debug, Default)]
pub struct ExecutionCounters {
    submissions: AtomicU64,
    items_processed: AtomicU64,
    batches: AtomicU64,
    accelerator_calls: AtomicU64,
    bisections: AtomicU64,
    oom_events: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl ExecutionCounters {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submission(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accelerator_call(&self) {
        self.accelerator_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_oom(&self) {
        self.oom_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bisection(&self) {
        self.bisections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, items: usize) {
        self.items_processed
            .fetch_add(u64::try_from(items).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bisections performed so far
    pub fn bisections(&self) -> u64 {
        self.bisections.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            submissions: self.submissions.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            accelerator_calls: self.accelerator_calls.load(Ordering::Relaxed),
            bisections: self.bisections.load(Ordering::Relaxed),
            oom_events: self.oom_events.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Executor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Calls to `execute_batched`
    pub submissions: u64,
    /// Items returned by successful submissions
    pub items_processed: u64,
    /// Ranges run under the device lock
    pub batches: u64,
    /// Raw model invocations, including retries
    pub accelerator_calls: u64,
    /// Out-of-memory bisections
    pub bisections: u64,
    /// Out-of-memory signals seen
    pub oom_events: u64,
    /// Submissions that failed
    pub failures: u64,
    /// Failed submissions since the last success
    pub consecutive_failures: u64,
}
