//! Per-endpoint circuit breaking.
//!
//! ```text
//!            threshold failures              cooldown elapsed
//!   CLOSED ─────────────────────▶ OPEN ─────────────────────▶ HALF_OPEN
//!     ▲                            ▲                              │
//!     │        probe succeeds      │  probe fails (cooldown x2)   │
//!     └────────────────────────────┼──────────────────────────────┤
//!                                  └──────────────────────────────┘
//! ```
//!
//! A half-open circuit lets exactly one probe through. Everything else is
//! rejected with `CircuitOpen` without touching the upstream.

use gridflow_core::{FailureClass, OrchestratorError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::metrics::prometheus as prom;

/// Configuration for circuit breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive health-counting failures before the circuit opens
    pub failure_threshold: u32,
    /// Initial open period
    pub cooldown_ms: u64,
    /// Upper bound for the doubled cooldown after failed probes
    pub max_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_ms: 30_000, max_cooldown_ms: 300_000 }
    }
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms.max(self.cooldown_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Outcome of one upstream attempt, as far as endpoint health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure(FailureClass),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
}

#[derive(Debug, Default)]
struct BreakerStats {
    allowed: AtomicU64,
    rejected: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    opens: AtomicU64,
}

/// Circuit breaker for a single endpoint
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitConfig) -> Self {
        let cooldown = config.cooldown();
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                probe_in_flight: false,
            }),
            stats: BreakerStats::default(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask to make one call. Rejects immediately while open or while the
    /// half-open probe is out.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, OrchestratorError> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let ready = inner
                    .opened_at
                    .map(|at| at.elapsed() >= inner.cooldown)
                    .unwrap_or(true);
                if !ready {
                    return Err(self.reject());
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.reject());
                }
                inner.probe_in_flight = true;
                true
            }
        };
        self.stats.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(CallPermit { breaker: Arc::clone(self), probe, recorded: false })
    }

    fn reject(&self) -> OrchestratorError {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        OrchestratorError::CircuitOpen { endpoint: self.endpoint.clone() }
    }

    fn record(&self, probe: bool, outcome: CallOutcome) {
        let mut inner = self.inner.lock();
        if probe {
            inner.probe_in_flight = false;
        }

        match outcome {
            CallOutcome::Success => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                match inner.state {
                    CircuitState::Closed => inner.consecutive_failures = 0,
                    CircuitState::HalfOpen if probe => {
                        inner.consecutive_failures = 0;
                        inner.cooldown = self.config.cooldown();
                        inner.opened_at = None;
                        self.transition(&mut inner, CircuitState::Closed);
                        info!(endpoint = %self.endpoint, "Circuit closed after successful probe");
                    }
                    _ => {}
                }
            }
            CallOutcome::Failure(class) if class.counts_against_health() => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                match inner.state {
                    CircuitState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                            inner.opened_at = Some(Instant::now());
                            inner.cooldown = self.config.cooldown();
                            self.stats.opens.fetch_add(1, Ordering::Relaxed);
                            self.transition(&mut inner, CircuitState::Open);
                            warn!(
                                endpoint = %self.endpoint,
                                failures = inner.consecutive_failures,
                                cooldown_ms = inner.cooldown.as_millis() as u64,
                                "Circuit opened"
                            );
                        }
                    }
                    CircuitState::HalfOpen if probe => {
                        inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown());
                        inner.opened_at = Some(Instant::now());
                        self.stats.opens.fetch_add(1, Ordering::Relaxed);
                        self.transition(&mut inner, CircuitState::Open);
                        warn!(
                            endpoint = %self.endpoint,
                            cooldown_ms = inner.cooldown.as_millis() as u64,
                            "Probe failed, circuit reopened"
                        );
                    }
                    _ => {}
                }
            }
            // Non-retryable and rate-limited replies say nothing about health.
            CallOutcome::Failure(_) => {}
        }
    }

    fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        inner.state = to;
        prom::record_circuit_transition(&self.endpoint, to.as_str(), to.gauge());
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_ms: inner.cooldown.as_millis() as u64,
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            opens: self.stats.opens.load(Ordering::Relaxed),
        }
    }
}

/// Permission to make one call. Report the result with [`CallPermit::record`];
/// dropping it unrecorded frees the probe slot without changing state.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    recorded: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: CallOutcome) {
        self.recorded = true;
        self.breaker.record(self.probe, outcome);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.recorded && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub successes: u64,
    pub failures: u64,
    pub opens: u64,
}

/// Lazily created breakers, one per endpoint.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone()))),
        )
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> =
            self.breakers.lock().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "read",
            CircuitConfig { failure_threshold: threshold, cooldown_ms, max_cooldown_ms: cooldown_ms * 4 },
        ))
    }

    fn fail(b: &Arc<CircuitBreaker>) {
        b.try_acquire().unwrap().record(CallOutcome::Failure(FailureClass::Transient));
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(3, 10_000);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);

        let err = b.try_acquire().unwrap_err();
        assert_eq!(err, OrchestratorError::CircuitOpen { endpoint: "read".into() });
        assert_eq!(b.snapshot().rejected, 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let b = breaker(2, 10_000);
        fail(&b);
        b.try_acquire().unwrap().record(CallOutcome::Success);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_neutral_failures_do_not_count() {
        let b = breaker(1, 10_000);
        b.try_acquire().unwrap().record(CallOutcome::Failure(FailureClass::NonRetryable));
        b.try_acquire().unwrap().record(CallOutcome::Failure(FailureClass::RateLimited));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_half_open_probe() {
        let b = breaker(1, 20);
        fail(&b);
        assert!(b.try_acquire().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_err(), "only one probe may be in flight");

        probe.record(CallOutcome::Success);
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_failed_probe_doubles_cooldown() {
        let b = breaker(1, 20);
        fail(&b);
        tokio::time::sleep(Duration::from_millis(30)).await;

        b.try_acquire().unwrap().record(CallOutcome::Failure(FailureClass::Timeout));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.snapshot().cooldown_ms, 40);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_dropped_probe_frees_slot() {
        let b = breaker(1, 10);
        fail(&b);
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn test_registry_isolates_endpoints() {
        let registry = CircuitBreakerRegistry::new(CircuitConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        fail(&registry.breaker("write"));
        assert_eq!(registry.breaker("write").state(), CircuitState::Open);
        assert_eq!(registry.breaker("read").state(), CircuitState::Closed);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
