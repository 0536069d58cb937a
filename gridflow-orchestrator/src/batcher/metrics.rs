//! Metrics for the write batcher.

use std::sync::atomic::{AtomicU64, Ordering};

use super::FlushTrigger;

/// Metrics for monitoring batcher behaviour
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Writes accepted into a window
    pub writes_received: AtomicU64,

    /// Writes dropped because the caller cancelled before the flush
    pub writes_cancelled: AtomicU64,

    /// Batches sent upstream
    pub batches_flushed: AtomicU64,

    /// Writes contained in flushed batches (for averaging)
    pub total_batch_writes: AtomicU64,

    /// Largest batch observed
    pub max_batch_size: AtomicU64,

    pub flushed_by_size: AtomicU64,
    pub flushed_by_age: AtomicU64,
    pub flushed_explicitly: AtomicU64,
    pub flushed_on_shutdown: AtomicU64,

    /// Windows sealed early so an overlapping write under another scope
    /// applies after them
    pub flushed_for_ordering: AtomicU64,

    /// Sub-writes rejected inside an otherwise successful batch
    pub sub_write_failures: AtomicU64,

    /// Sub-writes re-sent on their own after a transient failure
    pub individual_retries: AtomicU64,

    pub individual_retry_successes: AtomicU64,
}

impl BatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.writes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, count: usize) {
        self.writes_cancelled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a batch being sent
    pub fn record_flush(&self, trigger: FlushTrigger, size: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.total_batch_writes.fetch_add(size as u64, Ordering::Relaxed);
        self.max_batch_size.fetch_max(size as u64, Ordering::Relaxed);
        let counter = match trigger {
            FlushTrigger::Size => &self.flushed_by_size,
            FlushTrigger::Age => &self.flushed_by_age,
            FlushTrigger::Explicit => &self.flushed_explicitly,
            FlushTrigger::Shutdown => &self.flushed_on_shutdown,
            FlushTrigger::Ordering => &self.flushed_for_ordering,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sub_write_failure(&self) {
        self.sub_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_individual_retry(&self, succeeded: bool) {
        self.individual_retries.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.individual_retry_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Calculate average batch size
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_flushed.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batch_writes.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self, open_windows: usize) -> BatcherSnapshot {
        BatcherSnapshot {
            writes_received: self.writes_received.load(Ordering::Relaxed),
            writes_cancelled: self.writes_cancelled.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            max_batch_size: self.max_batch_size.load(Ordering::Relaxed),
            avg_batch_size: self.avg_batch_size(),
            flushed_by_size: self.flushed_by_size.load(Ordering::Relaxed),
            flushed_by_age: self.flushed_by_age.load(Ordering::Relaxed),
            flushed_explicitly: self.flushed_explicitly.load(Ordering::Relaxed),
            flushed_on_shutdown: self.flushed_on_shutdown.load(Ordering::Relaxed),
            flushed_for_ordering: self.flushed_for_ordering.load(Ordering::Relaxed),
            sub_write_failures: self.sub_write_failures.load(Ordering::Relaxed),
            individual_retries: self.individual_retries.load(Ordering::Relaxed),
            individual_retry_successes: self.individual_retry_successes.load(Ordering::Relaxed),
            open_windows,
        }
    }
}

/// Snapshot of batcher metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatcherSnapshot {
    pub writes_received: u64,
    pub writes_cancelled: u64,
    pub batches_flushed: u64,
    pub max_batch_size: u64,
    pub avg_batch_size: f64,
    pub flushed_by_size: u64,
    pub flushed_by_age: u64,
    pub flushed_explicitly: u64,
    pub flushed_on_shutdown: u64,
    pub flushed_for_ordering: u64,
    pub sub_write_failures: u64,
    pub individual_retries: u64,
    pub individual_retry_successes: u64,
    pub open_windows: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_accounting() {
        let metrics = BatcherMetrics::new();
        metrics.record_flush(FlushTrigger::Size, 4);
        metrics.record_flush(FlushTrigger::Age, 6);

        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.batches_flushed, 2);
        assert_eq!(snapshot.avg_batch_size, 5.0);
        assert_eq!(snapshot.max_batch_size, 6);
        assert_eq!(snapshot.flushed_by_size, 1);
        assert_eq!(snapshot.flushed_by_age, 1);
    }

    #[test]
    fn test_retry_accounting() {
        let metrics = BatcherMetrics::new();
        metrics.record_individual_retry(true);
        metrics.record_individual_retry(false);
        let snapshot = metrics.snapshot(3);
        assert_eq!(snapshot.individual_retries, 2);
        assert_eq!(snapshot.individual_retry_successes, 1);
        assert_eq!(snapshot.open_windows, 3);
    }
}
