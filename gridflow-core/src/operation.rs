//! The unit of work submitted to the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::fingerprint::Fingerprint;
use crate::payload::Payload;
use crate::target::Target;

/// Credential scope used when none is given.
pub const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
        }
    }
}

/// Admission priority. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Index into per-tier arrays, highest tier first.
    pub fn tier(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who issued an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Caller,
    Prefetch,
}

/// An immutable read or write against one resource.
///
/// Built with [`Operation::read`] / [`Operation::write`] and the `with_*`
/// methods; the fingerprint is recomputed whenever an identity-relevant field
/// changes.
#[derive(Debug, Clone)]
pub struct Operation {
    fingerprint: Fingerprint,
    kind: OperationKind,
    resource_id: String,
    target: Target,
    payload: Payload,
    args: BTreeMap<String, String>,
    priority: Priority,
    scope: String,
    origin: Origin,
    submitted_at: Instant,
}

impl Operation {
    pub fn read(resource_id: impl Into<String>, target: impl Into<Target>) -> Self {
        Self::build(OperationKind::Read, resource_id.into(), target.into(), Payload::Empty)
    }

    pub fn write(
        resource_id: impl Into<String>,
        target: impl Into<Target>,
        payload: Payload,
    ) -> Self {
        Self::build(OperationKind::Write, resource_id.into(), target.into(), payload)
    }

    fn build(kind: OperationKind, resource_id: String, target: Target, payload: Payload) -> Self {
        let args = BTreeMap::new();
        let fingerprint = Fingerprint::compute(kind, &resource_id, DEFAULT_SCOPE, &target, &args, &payload);
        Self {
            fingerprint,
            kind,
            resource_id,
            target,
            payload,
            args,
            priority: Priority::default(),
            scope: DEFAULT_SCOPE.to_string(),
            origin: Origin::Caller,
            submitted_at: Instant::now(),
        }
    }

    /// Add an argument that changes the upstream result.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self.refingerprint();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Credential scope the operation runs under. Operations under different
    /// scopes never share cached or in-flight results.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self.refingerprint();
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    fn refingerprint(&mut self) {
        self.fingerprint = Fingerprint::compute(
            self.kind,
            &self.resource_id,
            &self.scope,
            &self.target,
            &self.args,
            &self.payload,
        );
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_read(&self) -> bool {
        self.kind == OperationKind::Read
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}
