//! Metrics for prefetch.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::prometheus as prom;

/// Metrics for monitoring prefetch behaviour
#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    /// Access events recorded
    pub events_observed: AtomicU64,

    /// Predictions made (any confidence)
    pub predictions_total: AtomicU64,

    /// Candidates accepted into the queue
    pub tasks_queued: AtomicU64,

    /// Candidates rejected (low confidence, duplicate, queue full, expired)
    pub tasks_dropped: AtomicU64,

    /// Candidates handed to the pipeline
    pub tasks_submitted: AtomicU64,

    /// Prefetches that resolved successfully
    pub tasks_completed: AtomicU64,

    /// Prefetches that failed (logged, never surfaced)
    pub tasks_failed: AtomicU64,
}

impl PrefetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_observed(&self) {
        self.events_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_predictions(&self, count: usize) {
        self.predictions_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.tasks_queued.fetch_add(1, Ordering::Relaxed);
        prom::record_prefetch("queued");
    }

    pub fn record_dropped(&self) {
        self.tasks_dropped.fetch_add(1, Ordering::Relaxed);
        prom::record_prefetch("dropped");
    }

    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        prom::record_prefetch("submitted");
    }

    pub fn record_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        prom::record_prefetch("failed");
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self, queue_len: usize) -> PrefetchStats {
        let tasks_queued = self.tasks_queued.load(Ordering::Relaxed);
        let tasks_completed = self.tasks_completed.load(Ordering::Relaxed);
        PrefetchStats {
            events_observed: self.events_observed.load(Ordering::Relaxed),
            predictions_total: self.predictions_total.load(Ordering::Relaxed),
            tasks_queued,
            tasks_dropped: self.tasks_dropped.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed,
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            queue_len,
            completion_rate: if tasks_queued > 0 {
                tasks_completed as f64 / tasks_queued as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of prefetch statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct PrefetchStats {
    pub events_observed: u64,
    pub predictions_total: u64,
    pub tasks_queued: u64,
    pub tasks_dropped: u64,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub queue_len: usize,
    pub completion_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_rates() {
        let metrics = PrefetchMetrics::new();
        metrics.record_queued();
        metrics.record_queued();
        metrics.record_submitted();
        metrics.record_completed();

        let stats = metrics.snapshot(1);
        assert_eq!(stats.tasks_queued, 2);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.queue_len, 1);
        assert!((stats.completion_rate - 0.5).abs() < 1e-9);
    }
}
