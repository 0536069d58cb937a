//! Call gating in front of the upstream: circuit breaking per endpoint and
//! rate limiting per credential scope.

mod circuit;
mod rate_limit;

pub use circuit::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitConfig,
    CircuitSnapshot, CircuitState,
};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimitSnapshot, RateLimiter};
