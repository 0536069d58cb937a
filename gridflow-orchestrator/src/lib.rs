//! gridflow orchestrator library
//!
//! Sits between application code and a quota-constrained spreadsheet-style
//! API. Callers submit [`Operation`]s and await an [`OperationHandle`]; the
//! orchestrator batches writes, merges overlapping reads, shares identical
//! in-flight work, caches results, and keeps the upstream inside its rate
//! and health limits.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gridflow_core::{GridRange, Operation};
//! use gridflow_orchestrator::{MemoryUpstream, Orchestrator, OrchestratorConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let upstream = Arc::new(MemoryUpstream::new());
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), upstream)?;
//! let rows = orchestrator.execute(Operation::read("doc", GridRange::rows("Sheet1", 0, 10))).await?;
//! orchestrator.shutdown().await;
//! # Ok(()) }
//! ```

pub mod batcher;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod executor;
pub mod merger;
pub mod metrics;
pub mod orchestrator;
pub mod prefetch;
pub mod resilience;
pub mod sink;
pub mod upstream;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{Orchestrator, OrchestratorStats};
pub use sink::{OperationHandle, OperationResult};
pub use upstream::{FailureRule, HttpUpstream, MemoryUpstream, Upstream, UpstreamCall, UpstreamReply};

pub use gridflow_core::{
    GridRange, Operation, OperationError, OrchestratorError, Origin, Payload, Priority, Target,
};

use tracing::warn;

/// Register the Prometheus collectors. Call once at startup.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}
