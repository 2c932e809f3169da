//! Bus counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the event bus.
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Events accepted into a queue.
    published: AtomicU64,
    /// Events fully dispatched to their subscribers.
    delivered: AtomicU64,
    /// Handler invocations that errored, panicked or timed out.
    handler_failures: AtomicU64,
    /// Publishes rejected with `Overflow`.
    overflowed: AtomicU64,
    /// Queued or in-flight events discarded at shutdown.
    dropped: AtomicU64,
    /// `HandlerFailed` diagnostics that could not be enqueued.
    diagnostics_dropped: AtomicU64,
}

impl BusMetrics {
    /// Records an accepted publish.
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatched event.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed handler invocation.
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rejected publish.
    pub fn record_overflow(&self) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records events discarded at shutdown.
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a diagnostic that could not be enqueued.
    pub fn record_diagnostic_dropped(&self) {
        self.diagnostics_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of accepted publishes.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Returns the number of dispatched events.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Returns the number of failed handler invocations.
    #[must_use]
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of rejected publishes.
    #[must_use]
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Returns the number of events discarded at shutdown.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the number of diagnostics that could not be enqueued.
    #[must_use]
    pub fn diagnostics_dropped(&self) -> u64 {
        self.diagnostics_dropped.load(Ordering::Relaxed)
    }
}

/// Queue depth per priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    /// Events waiting in the critical queue.
    pub critical: usize,
    /// Events waiting in the high queue.
    pub high: usize,
    /// Events waiting in the normal queue.
    pub normal: usize,
    /// Events waiting in the low queue.
    pub low: usize,
}

impl QueueDepths {
    /// Total number of queued events.
    #[must_use]
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

/// Point-in-time view of the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusMetricsSnapshot {
    /// Whether publishes are accepted.
    pub accepting: bool,
    /// Whether the dispatch worker is running.
    pub running: bool,
    /// Registered subscriber count.
    pub subscribers: usize,
    /// Current queue depths.
    pub queue_depths: QueueDepths,
    /// See [`BusMetrics::published`].
    pub published: u64,
    /// See [`BusMetrics::delivered`].
    pub delivered: u64,
    /// See [`BusMetrics::handler_failures`].
    pub handler_failures: u64,
    /// See [`BusMetrics::overflowed`].
    pub overflowed: u64,
    /// See [`BusMetrics::dropped`].
    pub dropped: u64,
    /// See [`BusMetrics::diagnostics_dropped`].
    pub diagnostics_dropped: u64,
}

impl BusMetricsSnapshot {
    /// Converts the status to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
