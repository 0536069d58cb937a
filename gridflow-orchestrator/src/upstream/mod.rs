//! Outbound boundary to the spreadsheet API.
//!
//! The orchestration core talks to the upstream through a single
//! [`Upstream::invoke`] call. Everything in front of it (gating, retry,
//! batching) lives in this crate; everything behind it (auth, transport,
//! spreadsheet semantics) belongs to the adapter.
//!
//! Two adapters ship with the crate:
//!
//! - [`MemoryUpstream`]: in-process grid store with failure injection, used by
//!   the test suite and `gridflow simulate`
//! - [`HttpUpstream`]: JSON over HTTP

mod http;
mod memory;

pub use http::HttpUpstream;
pub use memory::{CallRecord, FailureRule, MemoryUpstream};

use async_trait::async_trait;
use gridflow_core::{Payload, Target, UpstreamError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One sub-write inside a batch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub target: Target,
    pub payload: Payload,
}

/// A single logical upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "call")]
pub enum UpstreamCall {
    Read {
        resource_id: String,
        target: Target,
        #[serde(default)]
        args: BTreeMap<String, String>,
        /// Conditional read: reply `NotModified` if the resource still matches
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validator: Option<String>,
    },
    Write {
        resource_id: String,
        target: Target,
        payload: Payload,
    },
    BatchWrite {
        resource_id: String,
        writes: Vec<WriteRequest>,
    },
}

impl UpstreamCall {
    /// Endpoint name used for circuit breaking, metrics and error context.
    pub fn endpoint(&self) -> &'static str {
        match self {
            UpstreamCall::Read { .. } => "read",
            UpstreamCall::Write { .. } => "write",
            UpstreamCall::BatchWrite { .. } => "batch_write",
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            UpstreamCall::Read { resource_id, .. }
            | UpstreamCall::Write { resource_id, .. }
            | UpstreamCall::BatchWrite { resource_id, .. } => resource_id,
        }
    }
}

/// A successful upstream reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reply")]
pub enum UpstreamReply {
    Data {
        payload: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validator: Option<String>,
    },
    /// Answer to a conditional read whose validator still matches
    NotModified,
    /// Per-write outcomes of a batch call, in request order
    Batch { results: Vec<Result<Payload, UpstreamError>> },
}

/// The upstream API client.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn invoke(&self, call: UpstreamCall) -> Result<UpstreamReply, UpstreamError>;
}
