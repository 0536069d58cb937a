//! Error types for gridflow
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the workspace.
//!
//! # Error Hierarchy
//!
//! ```text
//! UpstreamError      - what an upstream adapter reports for one call
//! OrchestratorError  - what the orchestration core decides after gating/retry
//! OperationError     - OrchestratorError tagged with the caller's fingerprint
//! ```
//!
//! Application code (the CLI) wraps these in `anyhow` with context.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// How an upstream failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worth retrying (5xx, connection reset, ...)
    Transient,
    /// Upstream quota exceeded; retry after the hinted delay
    RateLimited,
    /// Permission denied, not found, validation; never retried
    NonRetryable,
    /// The call did not answer in time
    Timeout,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::NonRetryable)
    }

    /// Whether this failure says something about the endpoint's health.
    pub fn counts_against_health(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Timeout)
    }
}

/// A failure reported by an upstream adapter for a single call or sub-call.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{class:?}: {message}")]
pub struct UpstreamError {
    pub class: FailureClass,
    pub message: String,
    /// Upstream hint for `RateLimited` failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl UpstreamError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self { class: FailureClass::Transient, message: msg.into(), retry_after_ms: None }
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self { class: FailureClass::NonRetryable, message: msg.into(), retry_after_ms: None }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self { class: FailureClass::Timeout, message: msg.into(), retry_after_ms: None }
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            class: FailureClass::RateLimited,
            message: msg.into(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Failure taxonomy surfaced by the orchestration core.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OrchestratorError {
    /// Limiter queue overflow, upstream quota exhausted, or too many pending operations
    #[error("rate limited on scope '{scope}' (retry after {retry_after_ms} ms)")]
    RateLimited { scope: String, retry_after_ms: u64 },

    /// The endpoint's circuit is open; no upstream attempt was made
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    /// Retryable failure that exhausted its attempts
    #[error("upstream failure on '{endpoint}' after {attempts} attempt(s): {message}")]
    UpstreamFailure { endpoint: String, attempts: u32, message: String },

    /// Permission/not-found/validation failure; never retried
    #[error("non-retryable failure on '{endpoint}' after {attempts} attempt(s): {message}")]
    NonRetryable { endpoint: String, attempts: u32, message: String },

    /// A call attempt or accumulation window exceeded its deadline
    #[error("timeout on '{endpoint}' after {attempts} attempt(s) ({elapsed_ms} ms)")]
    Timeout { endpoint: String, attempts: u32, elapsed_ms: u64 },

    /// The caller withdrew before resolution
    #[error("operation cancelled")]
    Cancelled,

    /// The orchestrator is shutting down
    #[error("orchestrator is shutting down")]
    Shutdown,
}

impl OrchestratorError {
    /// Convert an upstream failure into the surfaced taxonomy. Quota failures
    /// name the credential `scope` they were charged to.
    pub fn from_upstream(endpoint: &str, scope: &str, attempts: u32, err: &UpstreamError) -> Self {
        match err.class {
            FailureClass::NonRetryable => Self::NonRetryable {
                endpoint: endpoint.to_string(),
                attempts,
                message: err.message.clone(),
            },
            FailureClass::Transient => Self::UpstreamFailure {
                endpoint: endpoint.to_string(),
                attempts,
                message: err.message.clone(),
            },
            FailureClass::Timeout => Self::Timeout {
                endpoint: endpoint.to_string(),
                attempts,
                elapsed_ms: 0,
            },
            FailureClass::RateLimited => Self::RateLimited {
                scope: scope.to_string(),
                retry_after_ms: err.retry_after_ms.unwrap_or(0),
            },
        }
    }

    /// Short stable label for logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::NonRetryable { .. } => "non_retryable",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}

/// What a caller receives when its operation fails.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("operation {fingerprint}: {error}")]
pub struct OperationError {
    pub fingerprint: Fingerprint,
    #[source]
    pub error: OrchestratorError,
}

impl OperationError {
    pub fn new(fingerprint: Fingerprint, error: OrchestratorError) -> Self {
        Self { fingerprint, error }
    }
}
