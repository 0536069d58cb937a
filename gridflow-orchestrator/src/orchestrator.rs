//! The orchestrator façade.
//!
//! # Architecture
//!
//! ```text
//! submit(op) ──▶ pending slot ──┬── write ──▶ BatchingSystem ─────────────┐
//!                               │                                         │
//!                               └── read ──▶ ReadCache ── fresh ──▶ done  │
//!                                              │ miss / revalidate        │
//!                                              ▼                          │
//!                                        Deduplicator ── follower ──▶ wait│
//!                                              │ leader                   │
//!                                              ▼                          │
//!                                        RequestMerger                    │
//!                                              │                          ▼
//!                                              └──────▶ ParallelExecutor ◀┘
//!                                                          │
//!                                 coordinator ▶ circuit ▶ rate limiter ▶ Upstream
//! ```
//!
//! Reads resolve through the cache, then share in-flight work, then share
//! upstream calls with overlapping reads. Writes accumulate per resource and
//! go out as batches in submission order. Resolved reads feed the prefetch
//! tracker, whose predictions come back through `submit` at LOW priority.

use gridflow_core::{Operation, OperationError, OrchestratorError, Origin, Payload};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batcher::{BatcherSnapshot, BatchingSystem};
use crate::cache::{CacheStats, Epoch, Lookup, ReadCache};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::coordinator::{ConcurrencyCoordinator, CoordinatorSnapshot};
use crate::dedup::{DedupStats, Deduplicator, EntryId, Join};
use crate::executor::{ExecutorSnapshot, ParallelExecutor, UpstreamJob};
use crate::merger::{InterestProbe, MergedRead, MergerSnapshot, RequestMerger};
use crate::metrics::prometheus as prom;
use crate::prefetch::{PrefetchService, PrefetchStats};
use crate::resilience::{CircuitBreakerRegistry, CircuitSnapshot, RateLimitSnapshot, RateLimiter};
use crate::sink::{OperationHandle, ResultSink};
use crate::upstream::{Upstream, UpstreamCall, UpstreamReply};

struct Inner {
    config: OrchestratorConfig,
    coordinator: ConcurrencyCoordinator,
    circuits: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    executor: Arc<ParallelExecutor>,
    cache: Arc<ReadCache>,
    dedup: Arc<Deduplicator>,
    merger: Arc<RequestMerger>,
    batcher: Arc<BatchingSystem>,
    prefetch: Arc<PrefetchService>,
    pending: Arc<Semaphore>,
    shutting_down: AtomicBool,
    submitted: AtomicU64,
    rejected: AtomicU64,
}

/// Entry point: accepts operations and resolves each one exactly once.
///
/// Must be created inside a Tokio runtime.
pub struct Orchestrator {
    inner: Arc<Inner>,
    prefetch_worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build every component from `config` around `upstream`.
    pub fn new(config: OrchestratorConfig, upstream: Arc<dyn Upstream>) -> Result<Self, ConfigError> {
        config.validate()?;

        let coordinator = ConcurrencyCoordinator::new(&config.coordinator);
        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let executor = Arc::new(ParallelExecutor::new(
            config.executor.clone(),
            upstream,
            coordinator.clone(),
            circuits.clone(),
            limiter.clone(),
        ));
        let cache = Arc::new(ReadCache::new(config.cache.clone()));
        let dedup = Arc::new(Deduplicator::new());
        let merger = RequestMerger::new(config.merger.clone(), executor.clone());
        let batcher = BatchingSystem::new(config.batcher.clone(), executor.clone(), cache.clone(), dedup.clone());
        let prefetch = Arc::new(PrefetchService::new(config.prefetch.clone()));

        let inner = Arc::new(Inner {
            pending: Arc::new(Semaphore::new(config.max_pending_operations)),
            config,
            coordinator,
            circuits,
            limiter,
            executor,
            cache,
            dedup,
            merger,
            batcher,
            prefetch,
            shutting_down: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        let prefetch_worker = inner.prefetch.is_enabled().then(|| {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            tokio::spawn(inner.prefetch.clone().run_worker(move |op: Operation| match weak.upgrade() {
                Some(inner) => inner.submit(op),
                None => OperationHandle::failed(op.fingerprint(), OrchestratorError::Shutdown),
            }))
        });

        info!(
            max_concurrent = inner.config.coordinator.max_concurrent,
            max_pending = inner.config.max_pending_operations,
            merging = inner.config.merger.enabled,
            prefetch = inner.config.prefetch.enabled,
            "Orchestrator started"
        );

        Ok(Self { inner, prefetch_worker: parking_lot::Mutex::new(prefetch_worker) })
    }

    /// Accept an operation. The handle resolves exactly once with its result.
    pub fn submit(&self, op: Operation) -> OperationHandle {
        self.inner.clone().submit(op)
    }

    /// Submit and wait for the result.
    pub async fn execute(&self, op: Operation) -> Result<Payload, OperationError> {
        self.submit(op).await
    }

    /// Flush pending writes for `resource_id` and wait until they are applied.
    pub async fn flush(&self, resource_id: &str) -> usize {
        self.inner.batcher.flush(resource_id).await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Drop every cached read.
    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
    }

    /// Aggregated statistics from every component.
    pub async fn stats(&self) -> OrchestratorStats {
        let inner = &self.inner;
        let pending = inner.pending_count();
        prom::PENDING_OPERATIONS.set(pending as f64);
        OrchestratorStats {
            submitted: inner.submitted.load(Ordering::Relaxed),
            rejected: inner.rejected.load(Ordering::Relaxed),
            pending,
            coordinator: inner.coordinator.snapshot(),
            rate_limit: inner.limiter.snapshot(),
            circuits: inner.circuits.snapshot(),
            cache: inner.cache.stats().await,
            dedup: inner.dedup.snapshot(),
            merger: inner.merger.snapshot(),
            batcher: inner.batcher.snapshot(),
            executor: inner.executor.snapshot(),
            prefetch: inner.prefetch.stats().await,
        }
    }

    /// Stop accepting work, flush open groups and batches, and wait for every
    /// accepted operation to resolve.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pending = inner.pending_count(), "Orchestrator shutting down");

        inner.prefetch.stop().await;
        let worker = self.prefetch_worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "Prefetch worker ended abnormally");
            }
        }

        let groups = inner.merger.flush_all();
        let batches = inner.batcher.flush_all().await;
        debug!(groups, batches, "Flushed open groups and batches");

        // Every accepted operation holds one slot until it resolves
        let all = u32::try_from(inner.config.max_pending_operations).unwrap_or(u32::MAX);
        match inner.pending.acquire_many(all).await {
            Ok(slots) => drop(slots),
            Err(_) => warn!("Pending-operation gate closed early"),
        }
        inner.pending.close();

        inner.coordinator.close();
        inner.coordinator.drained().await;
        info!(submitted = inner.submitted.load(Ordering::Relaxed), "Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(worker) = self.prefetch_worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl Inner {
    fn pending_count(&self) -> usize {
        self.config.max_pending_operations.saturating_sub(self.pending.available_permits())
    }

    fn submit(self: Arc<Self>, op: Operation) -> OperationHandle {
        let fingerprint = op.fingerprint();
        if self.shutting_down.load(Ordering::Acquire) {
            return OperationHandle::failed(fingerprint, OrchestratorError::Shutdown);
        }
        let Ok(slot) = self.pending.clone().try_acquire_owned() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            prom::RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&["pending"]).inc();
            debug!(fingerprint = %fingerprint, "Too many pending operations");
            return OperationHandle::failed(
                fingerprint,
                OrchestratorError::RateLimited { scope: "pending".to_string(), retry_after_ms: 0 },
            );
        };
        self.submitted.fetch_add(1, Ordering::Relaxed);
        prom::PENDING_OPERATIONS.set(self.pending_count() as f64);

        let (sink, handle) = ResultSink::new(fingerprint, op.kind(), Some(slot));
        if op.is_read() {
            tokio::spawn(self.read(op, sink));
        } else {
            let prefetch = self.prefetch.clone();
            let observed = op.clone();
            self.batcher.submit(op, sink);
            if prefetch.is_enabled() {
                tokio::spawn(async move { prefetch.observe(&observed).await });
            }
        }
        handle
    }

    async fn read(self: Arc<Self>, op: Operation, sink: ResultSink) {
        let stale = match self.cache.lookup(&op).await {
            Lookup::Fresh(payload) => {
                sink.resolve(Ok(payload));
                self.prefetch.observe(&op).await;
                return;
            }
            Lookup::Revalidate { validator, payload } => Some((validator, payload)),
            Lookup::Miss => None,
        };

        let id = match self.dedup.join(&op, sink) {
            Join::Leader(id) => id,
            Join::Follower(_) => {
                self.prefetch.observe(&op).await;
                return;
            }
        };

        // A leader for the same fingerprint may have filled the cache and
        // resolved between our lookup and the join.
        if let Some(payload) = self.cache.peek_fresh(&op).await {
            self.dedup.resolve(id, Ok(payload));
            self.prefetch.observe(&op).await;
            return;
        }

        let epoch = self.cache.epoch(op.resource_id()).await;
        let result = match stale {
            Some((validator, payload)) => self.revalidate(&op, epoch, validator, payload).await,
            None => self.fetch(&op, id, epoch).await,
        };
        let ok = result.is_ok();
        let resolved = self.dedup.resolve(id, result);
        debug!(fingerprint = %op.fingerprint(), waiters = resolved, ok, "Read resolved");

        if ok {
            self.prefetch.observe(&op).await;
        }
    }

    async fn fetch(&self, op: &Operation, id: EntryId, epoch: Epoch) -> Result<Payload, OrchestratorError> {
        if !self.dedup.has_interest(id) {
            return Err(OrchestratorError::Cancelled);
        }
        let dedup = self.dedup.clone();
        let interest: InterestProbe = Box::new(move || dedup.has_interest(id));
        let MergedRead { payload, validator } = self.merger.fetch(op, interest).await?;
        self.cache.put_if_epoch(op, epoch, payload.clone(), validator).await;
        Ok(payload)
    }

    /// Conditional read for an expired entry that carries a validator.
    async fn revalidate(
        &self,
        op: &Operation,
        epoch: Epoch,
        validator: String,
        stale: Payload,
    ) -> Result<Payload, OrchestratorError> {
        let call = UpstreamCall::Read {
            resource_id: op.resource_id().to_string(),
            target: op.target().clone(),
            args: op.args().clone(),
            validator: Some(validator.clone()),
        };
        let mut job = UpstreamJob::new(call, op.priority(), op.scope());
        if op.origin() == Origin::Prefetch {
            job = job.without_retry();
        }

        match self.executor.execute(job).await? {
            UpstreamReply::NotModified => {
                self.cache.refresh(op, epoch, stale.clone(), validator).await;
                Ok(stale)
            }
            UpstreamReply::Data { payload, validator } => {
                self.cache.put_if_epoch(op, epoch, payload.clone(), validator).await;
                Ok(payload)
            }
            UpstreamReply::Batch { .. } => Err(OrchestratorError::NonRetryable {
                endpoint: "read".to_string(),
                attempts: 1,
                message: "batch reply to a read".to_string(),
            }),
        }
    }
}

/// Point-in-time statistics for the whole orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub submitted: u64,
    pub rejected: u64,
    pub pending: usize,
    pub coordinator: CoordinatorSnapshot,
    pub rate_limit: RateLimitSnapshot,
    pub circuits: Vec<CircuitSnapshot>,
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub merger: MergerSnapshot,
    pub batcher: BatcherSnapshot,
    pub executor: ExecutorSnapshot,
    pub prefetch: PrefetchStats,
}
