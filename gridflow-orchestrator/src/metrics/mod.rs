//! Metrics module for the gridflow orchestrator
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

pub use prometheus::{encode_metrics, register_metrics, REGISTRY};
