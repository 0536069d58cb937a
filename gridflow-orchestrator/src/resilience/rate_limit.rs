//! Fixed-window rate limiting per credential scope.
//!
//! Each scope gets `limit` calls per `window_ms`. A call that finds the window
//! exhausted sleeps until the window rolls over; at most `max_waiting` calls
//! may sleep at once, beyond that the call fails with `RateLimited`.
//!
//! Upstream quota replies feed back through [`RateLimiter::penalize`], which
//! blocks the scope until the upstream's `Retry-After` deadline.

use gridflow_core::OrchestratorError;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::metrics::prometheus as prom;

/// Scopes tracked at once; the least recently used window is forgotten.
const MAX_SCOPES: usize = 4096;

/// Configuration for the rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls allowed per window per scope
    pub limit: u32,
    /// Window length
    pub window_ms: u64,
    /// Calls allowed to wait for the next window before rejection
    pub max_waiting: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { limit: 300, window_ms: 60_000, max_waiting: 256 }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Result of a non-blocking consume attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct RateWindow {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct RateStats {
    allowed: AtomicU64,
    delayed: AtomicU64,
    rejected: AtomicU64,
    penalties: AtomicU64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<LruCache<String, RateWindow>>,
    waiting: AtomicUsize,
    stats: RateStats,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = NonZeroUsize::new(MAX_SCOPES).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            windows: Mutex::new(LruCache::new(capacity)),
            waiting: AtomicUsize::new(0),
            stats: RateStats::default(),
        }
    }

    /// Consume one call from `scope` if the window allows it.
    pub fn try_consume(&self, scope: &str) -> RateDecision {
        let now = Instant::now();
        let window_len = self.config.window();
        let mut windows = self.windows.lock();
        let window = windows.get_or_insert_mut(scope.to_string(), || RateWindow {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(until) = window.blocked_until {
            if until > now {
                return RateDecision { allowed: false, retry_after: until - now };
            }
            window.blocked_until = None;
        }

        if now.duration_since(window.window_start) >= window_len {
            window.count = 0;
            window.window_start = now;
        }

        if window.count < self.config.limit {
            window.count += 1;
            RateDecision { allowed: true, retry_after: Duration::ZERO }
        } else {
            let retry_after = (window.window_start + window_len).saturating_duration_since(now);
            RateDecision { allowed: false, retry_after }
        }
    }

    /// Admit one call from `scope` without waiting.
    pub fn try_acquire(&self, scope: &str) -> bool {
        let allowed = self.try_consume(scope).allowed;
        if allowed {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Wait until `scope` admits one call, or fail if too many are waiting.
    pub async fn acquire(&self, scope: &str) -> Result<(), OrchestratorError> {
        let first = self.try_consume(scope);
        if first.allowed {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if self.waiting.fetch_add(1, Ordering::AcqRel) >= self.config.max_waiting {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            prom::RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&[scope]).inc();
            warn!(scope, waiting = self.config.max_waiting, "Rate limiter queue full");
            return Err(OrchestratorError::RateLimited {
                scope: scope.to_string(),
                retry_after_ms: first.retry_after.as_millis() as u64,
            });
        }
        let _waiting = WaitingSlot(&self.waiting);
        self.stats.delayed.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let mut decision = first;
        while !decision.allowed {
            debug!(scope, retry_after_ms = decision.retry_after.as_millis() as u64, "Rate limited, waiting");
            tokio::time::sleep(decision.retry_after.max(Duration::from_millis(1))).await;
            decision = self.try_consume(scope);
        }

        prom::RATE_LIMIT_DELAY_SECONDS.observe(started.elapsed().as_secs_f64());
        self.stats.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Block `scope` for `retry_after` after the upstream reported quota exhaustion.
    pub fn penalize(&self, scope: &str, retry_after: Duration) {
        let now = Instant::now();
        let until = now + retry_after;
        let mut windows = self.windows.lock();
        let window = windows.get_or_insert_mut(scope.to_string(), || RateWindow {
            count: 0,
            window_start: now,
            blocked_until: None,
        });
        if window.blocked_until.map(|b| b < until).unwrap_or(true) {
            window.blocked_until = Some(until);
        }
        self.stats.penalties.fetch_add(1, Ordering::Relaxed);
        warn!(scope, retry_after_ms = retry_after.as_millis() as u64, "Upstream quota exhausted");
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            scopes: self.windows.lock().len(),
            waiting: self.waiting.load(Ordering::Relaxed),
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            delayed: self.stats.delayed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            penalties: self.stats.penalties.load(Ordering::Relaxed),
        }
    }
}

struct WaitingSlot<'a>(&'a AtomicUsize);

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub scopes: usize,
    pub waiting: usize,
    pub allowed: u64,
    pub delayed: u64,
    pub rejected: u64,
    pub penalties: u64,
}
