//! Bounded-parallel upstream execution with per-call retry.
//!
//! Each attempt passes the gates in a fixed order before touching the
//! upstream:
//!
//! ```text
//! coordinator.acquire(priority)      global slot, held for the attempt
//!        │
//! circuit.try_acquire(endpoint)      fail fast while OPEN
//!        │
//! rate_limiter.try_acquire(scope)    quota for the credential scope
//!        │   throttled: release slot and circuit permit,
//!        │   wait in the limiter queue, then take both again
//!        │
//! timeout(upstream.invoke(call))     per-attempt deadline
//! ```
//!
//! A throttled scope never holds a global slot or the half-open probe while it
//! sleeps, so calls on other scopes keep flowing.
//!
//! Gate rejections (circuit open, limiter overflow, shutdown) are returned
//! as-is. Upstream failures are retried with capped exponential backoff unless
//! non-retryable or the job opted out of retries.

mod retry;

pub use retry::RetryPolicy;

use futures::stream::{self, StreamExt};
use gridflow_core::{FailureClass, OrchestratorError, Priority, UpstreamError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::coordinator::ConcurrencyCoordinator;
use crate::metrics::prometheus as prom;
use crate::resilience::{CallOutcome, CircuitBreakerRegistry, RateLimiter};
use crate::upstream::{Upstream, UpstreamCall, UpstreamReply};

/// Configuration for the parallel executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Calls from one `execute_all` running at once (still subject to the coordinator)
    pub max_parallel: usize,
    /// Attempts per call, including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Deadline for a single upstream attempt
    pub attempt_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            max_attempts: 4,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl ExecutorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base: Duration::from_millis(self.base_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
        }
    }
}

/// One upstream call plus the context needed to gate it.
#[derive(Debug, Clone)]
pub struct UpstreamJob {
    pub call: UpstreamCall,
    pub priority: Priority,
    pub scope: String,
    /// Retry retryable failures; prefetches run once.
    pub retry: bool,
}

impl UpstreamJob {
    pub fn new(call: UpstreamCall, priority: Priority, scope: impl Into<String>) -> Self {
        Self { call, priority, scope: scope.into(), retry: true }
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

enum AttemptError {
    /// Rejected before reaching the upstream
    Gate(OrchestratorError),
    Upstream(UpstreamError),
}

#[derive(Debug, Default)]
struct ExecutorStats {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// Executes upstream calls through the shared gates
pub struct ParallelExecutor {
    config: ExecutorConfig,
    policy: RetryPolicy,
    upstream: Arc<dyn Upstream>,
    coordinator: ConcurrencyCoordinator,
    circuits: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    stats: ExecutorStats,
}

impl ParallelExecutor {
    pub fn new(
        config: ExecutorConfig,
        upstream: Arc<dyn Upstream>,
        coordinator: ConcurrencyCoordinator,
        circuits: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let policy = config.retry_policy();
        Self { config, policy, upstream, coordinator, circuits, limiter, stats: ExecutorStats::default() }
    }

    /// Run one call to completion, retrying as configured.
    pub async fn execute(&self, job: UpstreamJob) -> Result<UpstreamReply, OrchestratorError> {
        let endpoint = job.call.endpoint();
        let max_attempts = if job.retry { self.policy.max_attempts } else { 1 };
        let started = Instant::now();
        self.stats.calls.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&job).await {
                Ok(reply) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .total_latency_ms
                        .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    return Ok(reply);
                }
                Err(AttemptError::Gate(err)) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint, attempt, error = %err, "Call rejected by gate");
                    return Err(err);
                }
                Err(AttemptError::Upstream(err)) => {
                    if err.class == FailureClass::RateLimited {
                        if let Some(retry_after) = err.retry_after() {
                            self.limiter.penalize(&job.scope, retry_after);
                        }
                    }

                    if !err.class.is_retryable() || attempt >= max_attempts {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            endpoint,
                            attempts = attempt,
                            class = ?err.class,
                            error = %err.message,
                            "Upstream call failed"
                        );
                        return Err(self.surface(endpoint, &job.scope, attempt, started, &err));
                    }

                    let delay = self.policy.backoff(attempt);
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    prom::UPSTREAM_RETRIES_TOTAL.with_label_values(&[endpoint]).inc();
                    debug!(
                        endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        class = ?err.class,
                        "Retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run independent calls with bounded parallelism. Outcomes keep input order.
    pub async fn execute_all(
        &self,
        jobs: Vec<UpstreamJob>,
    ) -> Vec<Result<UpstreamReply, OrchestratorError>> {
        let parallel = self.config.max_parallel.max(1);
        stream::iter(jobs)
            .map(|job| self.execute(job))
            .buffered(parallel)
            .collect()
            .await
    }

    async fn attempt(&self, job: &UpstreamJob) -> Result<UpstreamReply, AttemptError> {
        let endpoint = job.call.endpoint();

        let breaker = self.circuits.breaker(endpoint);
        let mut slot = self.coordinator.acquire(job.priority).await.map_err(AttemptError::Gate)?;
        let mut permit = breaker.try_acquire().map_err(AttemptError::Gate)?;

        if !self.limiter.try_acquire(&job.scope) {
            drop(permit);
            drop(slot);
            debug!(endpoint, scope = %job.scope, "Scope throttled, released slot while waiting");
            self.limiter.acquire(&job.scope).await.map_err(AttemptError::Gate)?;
            slot = self.coordinator.acquire(job.priority).await.map_err(AttemptError::Gate)?;
            permit = breaker.try_acquire().map_err(AttemptError::Gate)?;
        }
        let _slot = slot;

        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let timeout = self.config.attempt_timeout();
        let result = match tokio::time::timeout(timeout, self.upstream.invoke(job.call.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::timeout(format!(
                "attempt exceeded {} ms",
                timeout.as_millis()
            ))),
        };

        let secs = started.elapsed().as_secs_f64();
        match &result {
            Ok(_) => {
                permit.record(CallOutcome::Success);
                prom::record_upstream_attempt(endpoint, "ok", secs);
            }
            Err(err) => {
                if err.class == FailureClass::Timeout {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                permit.record(CallOutcome::Failure(err.class));
                prom::record_upstream_attempt(endpoint, failure_label(err.class), secs);
            }
        }

        result.map_err(AttemptError::Upstream)
    }

    fn surface(
        &self,
        endpoint: &str,
        scope: &str,
        attempts: u32,
        started: Instant,
        err: &UpstreamError,
    ) -> OrchestratorError {
        match err.class {
            FailureClass::Timeout => OrchestratorError::Timeout {
                endpoint: endpoint.to_string(),
                attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            _ => OrchestratorError::from_upstream(endpoint, scope, attempts, err),
        }
    }

    pub fn snapshot(&self) -> ExecutorSnapshot {
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        let total_latency = self.stats.total_latency_ms.load(Ordering::Relaxed);
        ExecutorSnapshot {
            calls: self.stats.calls.load(Ordering::Relaxed),
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            succeeded,
            failed: self.stats.failed.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            avg_latency_ms: if succeeded == 0 { 0.0 } else { total_latency as f64 / succeeded as f64 },
        }
    }
}

fn failure_label(class: FailureClass) -> &'static str {
    match class {
        FailureClass::Transient => "transient",
        FailureClass::RateLimited => "rate_limited",
        FailureClass::NonRetryable => "non_retryable",
        FailureClass::Timeout => "timeout",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorSnapshot {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
}
