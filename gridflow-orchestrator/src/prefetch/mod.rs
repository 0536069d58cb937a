//! Access-pattern driven prefetch.
//!
//! # Architecture
//!
//! ```text
//! resolved operation
//!        │
//!        ▼
//! AccessPatternTracker  (bounded history per resource)
//!        │
//!        ▼
//! PrefetchPredictor     (repeating stride between range reads)
//!        │ candidates ≥ confidence_threshold
//!        ▼
//! PrefetchQueue         (highest confidence first, bounded)
//!        │
//!        ▼ at most max_inflight at a time
//! Background worker ──▶ LOW priority read through the normal pipeline
//! ```
//!
//! Prefetched reads go through cache, dedup and merging like any other read
//! and land in the shared cache. They are admitted at LOW priority, get a
//! single attempt, are never recorded as access events themselves, and their
//! failures are only logged.

mod config;
mod metrics;
mod predictor;
mod queue;
mod tracker;

pub use config::PrefetchConfig;
pub use metrics::{PrefetchMetrics, PrefetchStats};
pub use predictor::{PrefetchCandidate, PrefetchPredictor};
pub use queue::PrefetchQueue;
pub use tracker::{AccessEvent, AccessPatternTracker};

use gridflow_core::{Operation, OperationError, Origin, Payload};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info};

/// Main prefetch service
pub struct PrefetchService {
    config: PrefetchConfig,
    tracker: AccessPatternTracker,
    predictor: PrefetchPredictor,
    queue: PrefetchQueue,
    metrics: Arc<PrefetchMetrics>,
    wakeup: Notify,
    stopped: AtomicBool,
}

impl PrefetchService {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            tracker: AccessPatternTracker::new(config.history_size, config.history_age()),
            predictor: PrefetchPredictor::new(),
            queue: PrefetchQueue::new(config.max_queue),
            metrics: Arc::new(PrefetchMetrics::new()),
            wakeup: Notify::new(),
            stopped: AtomicBool::new(false),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record a resolved operation and queue any confident predictions.
    pub async fn observe(&self, op: &Operation) {
        if !self.config.enabled || op.origin() == Origin::Prefetch || self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.metrics.record_observed();

        let history = self.tracker.record(AccessEvent::from_operation(op));
        if !op.is_read() {
            return;
        }
        let candidates = self.predictor.predict(&history, self.config.lookahead.max(1));
        if candidates.is_empty() {
            return;
        }
        self.metrics.record_predictions(candidates.len());

        let mut queued = 0;
        for candidate in candidates {
            if candidate.confidence < self.config.confidence_threshold {
                self.metrics.record_dropped();
                continue;
            }
            debug!(
                resource = op.resource_id(),
                target = %candidate.operation.target(),
                confidence = candidate.confidence,
                "Prefetch candidate"
            );
            if self.queue.push(candidate).await {
                self.metrics.record_queued();
                queued += 1;
            } else {
                self.metrics.record_dropped();
            }
        }
        if queued > 0 {
            self.wakeup.notify_one();
        }
    }

    /// Background worker: pops candidates and hands them to `submit`.
    ///
    /// Returns once [`stop`](Self::stop) is called.
    pub async fn run_worker<F, Fut>(self: Arc<Self>, submit: F)
    where
        F: Fn(Operation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, OperationError>> + Send + 'static,
    {
        if !self.config.enabled {
            info!("Prefetch disabled, worker not starting");
            return;
        }
        info!(max_inflight = self.config.max_inflight, "Prefetch worker started");

        let submit = Arc::new(submit);
        let inflight = Arc::new(Semaphore::new(self.config.max_inflight.max(1)));
        let max_age = self.config.history_age();

        while !self.stopped.load(Ordering::Acquire) {
            let expired = self.queue.remove_expired(max_age).await;
            for _ in 0..expired {
                self.metrics.record_dropped();
            }

            let Some(candidate) = self.queue.pop().await else {
                self.wakeup.notified().await;
                continue;
            };

            let Ok(permit) = inflight.clone().acquire_owned().await else {
                break;
            };
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            self.metrics.record_submitted();
            let metrics = self.metrics.clone();
            let fut = submit(candidate.operation);
            tokio::spawn(async move {
                let result = fut.await;
                drop(permit);
                match result {
                    Ok(_) => metrics.record_completed(),
                    Err(err) => {
                        metrics.record_failed();
                        debug!(fingerprint = %err.fingerprint, error = %err.error, "Prefetch failed");
                    }
                }
            });
        }
        info!("Prefetch worker stopped");
    }

    /// Stop the worker and drop queued candidates.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup.notify_one();
        let dropped = self.queue.clear().await;
        if dropped > 0 {
            debug!(dropped, "Discarded queued prefetches");
        }
    }

    pub fn tracker(&self) -> &AccessPatternTracker {
        &self.tracker
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    pub async fn stats(&self) -> PrefetchStats {
        self.metrics.snapshot(self.queue.len().await)
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }
}
