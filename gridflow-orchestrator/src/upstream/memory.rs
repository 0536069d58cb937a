//! In-process upstream backed by a sparse cell map.
//!
//! Behaves like a small spreadsheet service: range reads and writes, opaque
//! selector documents, a per-resource revision used as the read validator,
//! and a call log. Failures and latency can be injected to exercise the
//! retry, circuit and batching paths.

use async_trait::async_trait;
use gridflow_core::{FailureClass, GridRange, Payload, Target, UpstreamError, ALL_COLUMNS};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use super::{Upstream, UpstreamCall, UpstreamReply, WriteRequest};

#[derive(Debug, Default)]
struct Document {
    /// (sheet, row, col) -> value
    cells: BTreeMap<(String, u32, u32), Value>,
    selectors: HashMap<String, Value>,
    revision: u64,
}

impl Document {
    fn validator(&self) -> String {
        format!("rev-{}", self.revision)
    }

    fn last_column(&self, sheet: &str) -> Option<u32> {
        self.cells
            .keys()
            .filter(|(s, _, _)| s == sheet)
            .map(|(_, _, col)| *col)
            .max()
    }

    fn read_range(&self, range: &GridRange) -> Payload {
        let end_col = if range.end_col == ALL_COLUMNS {
            self.last_column(&range.sheet).map(|c| c + 1).unwrap_or(range.start_col)
        } else {
            range.end_col
        };

        let rows = (range.start_row..range.end_row)
            .map(|row| {
                (range.start_col..end_col.max(range.start_col))
                    .map(|col| {
                        self.cells
                            .get(&(range.sheet.clone(), row, col))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();
        Payload::Values(rows)
    }

    fn apply(&mut self, write: &WriteRequest) -> Result<Payload, UpstreamError> {
        match (&write.target, &write.payload) {
            (Target::Range(range), Payload::Values(rows)) => {
                for (r, row) in rows.iter().enumerate() {
                    for (c, value) in row.iter().enumerate() {
                        let key = (range.sheet.clone(), range.start_row + r as u32, range.start_col + c as u32);
                        self.cells.insert(key, value.clone());
                    }
                }
            }
            (Target::Selector(name), payload) => {
                let value = match payload {
                    Payload::Json(v) => v.clone(),
                    other => serde_json::to_value(other).unwrap_or(Value::Null),
                };
                self.selectors.insert(name.clone(), value);
            }
            (Target::Whole, Payload::Empty) => {
                self.cells.clear();
                self.selectors.clear();
            }
            (target, _) => {
                return Err(UpstreamError::non_retryable(format!(
                    "unsupported write payload for {}",
                    target
                )))
            }
        }
        self.revision += 1;
        Ok(Payload::Json(serde_json::json!({ "revision": self.revision })))
    }
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub struct FailureRule {
    /// Only calls to this endpoint (`read`, `write`, `batch_write`)
    pub endpoint: Option<&'static str>,
    /// Only calls (or batch sub-writes) whose target overlaps this one
    pub target: Option<Target>,
    pub class: FailureClass,
    /// How many more times the rule fires; `None` means forever
    pub remaining: Option<u32>,
}

impl FailureRule {
    pub fn new(class: FailureClass) -> Self {
        Self { endpoint: None, target: None, class, remaining: None }
    }

    pub fn on_endpoint(mut self, endpoint: &'static str) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn on_target(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, endpoint: &str, target: Option<&Target>) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if self.endpoint.map(|e| e != endpoint).unwrap_or(false) {
            return false;
        }
        match (&self.target, target) {
            (None, _) => true,
            (Some(rule), Some(t)) => rule.overlaps(t),
            (Some(_), None) => false,
        }
    }

    fn fire(&mut self) -> UpstreamError {
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        let message = format!("injected {:?} failure", self.class);
        match self.class {
            FailureClass::Transient => UpstreamError::transient(message),
            FailureClass::NonRetryable => UpstreamError::non_retryable(message),
            FailureClass::Timeout => UpstreamError::timeout(message),
            FailureClass::RateLimited => {
                UpstreamError::rate_limited(message, Some(Duration::from_millis(10)))
            }
        }
    }
}

/// One logged upstream call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub endpoint: &'static str,
    pub resource_id: String,
    pub targets: Vec<Target>,
}

/// In-memory [`Upstream`] implementation.
#[derive(Default)]
pub struct MemoryUpstream {
    documents: Mutex<HashMap<String, Document>>,
    calls: Mutex<Vec<CallRecord>>,
    failures: Mutex<Vec<FailureRule>>,
    latency: Mutex<Duration>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add artificial latency to every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Seed a range with values without going through the call log.
    pub fn seed(&self, resource_id: &str, range: GridRange, rows: Vec<Vec<Value>>) {
        let mut docs = self.documents.lock();
        let doc = docs.entry(resource_id.to_string()).or_default();
        // Seeding never fails: range targets with value payloads are always accepted.
        let _ = doc.apply(&WriteRequest { target: Target::Range(range), payload: Payload::Values(rows) });
    }

    pub fn inject(&self, rule: FailureRule) {
        self.failures.lock().push(rule);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.endpoint == endpoint).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Current contents of a range, bypassing the call log.
    pub fn snapshot(&self, resource_id: &str, range: &GridRange) -> Payload {
        let docs = self.documents.lock();
        docs.get(resource_id)
            .map(|doc| doc.read_range(range))
            .unwrap_or(Payload::Values(Vec::new()))
    }

    fn check_failure(&self, endpoint: &str, target: Option<&Target>) -> Option<UpstreamError> {
        let mut rules = self.failures.lock();
        rules
            .iter_mut()
            .find(|rule| rule.matches(endpoint, target))
            .map(FailureRule::fire)
    }

    fn record(&self, call: &UpstreamCall) {
        let targets = match call {
            UpstreamCall::Read { target, .. } | UpstreamCall::Write { target, .. } => {
                vec![target.clone()]
            }
            UpstreamCall::BatchWrite { writes, .. } => {
                writes.iter().map(|w| w.target.clone()).collect()
            }
        };
        self.calls.lock().push(CallRecord {
            endpoint: call.endpoint(),
            resource_id: call.resource_id().to_string(),
            targets,
        });
    }
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn invoke(&self, call: UpstreamCall) -> Result<UpstreamReply, UpstreamError> {
        self.record(&call);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let endpoint = call.endpoint();
        debug!(endpoint, resource = call.resource_id(), "memory upstream call");

        match call {
            UpstreamCall::Read { resource_id, target, validator, .. } => {
                if let Some(err) = self.check_failure(endpoint, Some(&target)) {
                    return Err(err);
                }
                let docs = self.documents.lock();
                let empty = Document::default();
                let doc = docs.get(&resource_id).unwrap_or(&empty);

                let current = doc.validator();
                if validator.as_deref() == Some(current.as_str()) {
                    return Ok(UpstreamReply::NotModified);
                }

                let payload = match &target {
                    Target::Range(range) => doc.read_range(range),
                    Target::Selector(name) => {
                        Payload::Json(doc.selectors.get(name).cloned().unwrap_or(Value::Null))
                    }
                    Target::Whole => Payload::Json(serde_json::json!({
                        "cells": doc.cells.len(),
                        "revision": doc.revision,
                    })),
                };
                Ok(UpstreamReply::Data { payload, validator: Some(current) })
            }
            UpstreamCall::Write { resource_id, target, payload } => {
                if let Some(err) = self.check_failure(endpoint, Some(&target)) {
                    return Err(err);
                }
                let mut docs = self.documents.lock();
                let doc = docs.entry(resource_id).or_default();
                let reply = doc.apply(&WriteRequest { target, payload })?;
                Ok(UpstreamReply::Data { payload: reply, validator: Some(doc.validator()) })
            }
            UpstreamCall::BatchWrite { resource_id, writes } => {
                if let Some(err) = self.check_failure(endpoint, None) {
                    return Err(err);
                }
                let mut results = Vec::with_capacity(writes.len());
                for write in &writes {
                    if let Some(err) = self.check_failure(endpoint, Some(&write.target)) {
                        results.push(Err(err));
                        continue;
                    }
                    let mut docs = self.documents.lock();
                    let doc = docs.entry(resource_id.clone()).or_default();
                    results.push(doc.apply(write));
                }
                Ok(UpstreamReply::Batch { results })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: u32) -> Vec<Vec<Value>> {
        (0..n).map(|i| vec![json!(i)]).collect()
    }

    #[tokio::test]
    async fn test_read_after_seed() {
        let upstream = MemoryUpstream::new();
        upstream.seed("doc", GridRange::rows("S", 0, 5), rows(5));

        let reply = upstream
            .invoke(UpstreamCall::Read {
                resource_id: "doc".into(),
                target: Target::Range(GridRange::rows("S", 1, 3)),
                args: BTreeMap::new(),
                validator: None,
            })
            .await
            .unwrap();

        match reply {
            UpstreamReply::Data { payload, validator } => {
                assert_eq!(payload, Payload::Values(vec![vec![json!(1)], vec![json!(2)]]));
                assert_eq!(validator.as_deref(), Some("rev-1"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(upstream.call_count("read"), 1);
    }

    #[tokio::test]
    async fn test_conditional_read_not_modified() {
        let upstream = MemoryUpstream::new();
        upstream.seed("doc", GridRange::rows("S", 0, 1), rows(1));

        let reply = upstream
            .invoke(UpstreamCall::Read {
                resource_id: "doc".into(),
                target: Target::Range(GridRange::rows("S", 0, 1)),
                args: BTreeMap::new(),
                validator: Some("rev-1".into()),
            })
            .await
            .unwrap();
        assert_eq!(reply, UpstreamReply::NotModified);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let upstream = MemoryUpstream::new();
        let bad = GridRange::rows("S", 2, 3);
        upstream.inject(FailureRule::new(FailureClass::NonRetryable).on_target(bad.clone()));

        let writes = (0..4)
            .map(|i| WriteRequest {
                target: Target::Range(GridRange::rows("S", i, i + 1)),
                payload: Payload::Values(vec![vec![json!(i)]]),
            })
            .collect();
        let reply = upstream
            .invoke(UpstreamCall::BatchWrite { resource_id: "doc".into(), writes })
            .await
            .unwrap();

        let UpstreamReply::Batch { results } = reply else {
            panic!("expected batch reply");
        };
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
        assert_eq!(results[2].as_ref().unwrap_err().class, FailureClass::NonRetryable);
        assert_eq!(upstream.snapshot("doc", &bad), Payload::Values(vec![vec![Value::Null]]));
    }

    #[tokio::test]
    async fn test_failure_rule_times() {
        let upstream = MemoryUpstream::new();
        upstream.inject(FailureRule::new(FailureClass::Transient).on_endpoint("read").times(1));

        let call = UpstreamCall::Read {
            resource_id: "doc".into(),
            target: Target::Whole,
            args: BTreeMap::new(),
            validator: None,
        };
        assert!(upstream.invoke(call.clone()).await.is_err());
        assert!(upstream.invoke(call).await.is_ok());
    }
}
