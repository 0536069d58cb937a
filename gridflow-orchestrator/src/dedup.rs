//! In-flight deduplication for reads.
//!
//! The first read for a fingerprint becomes the leader and performs the
//! fetch; identical reads arriving before it resolves subscribe to the same
//! entry and receive a clone of the leader's outcome.
//!
//! Entries are addressed by an id, not only by fingerprint: a write can
//! [detach](Deduplicator::detach_overlapping) an in-flight entry from the
//! fingerprint index so later reads start a fresh fetch, while the detached
//! entry still resolves the subscribers it already has.

use gridflow_core::{Fingerprint, Operation, OrchestratorError, Payload, Target};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

use crate::metrics::prometheus as prom;
use crate::sink::ResultSink;

/// Identifier of one in-flight entry.
pub type EntryId = u64;

/// Outcome of [`Deduplicator::join`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// Caller must perform the fetch and call [`Deduplicator::resolve`].
    Leader(EntryId),
    /// Caller's sink was attached to an existing fetch.
    Follower(EntryId),
}

struct InFlightEntry {
    fingerprint: Fingerprint,
    resource_id: String,
    target: Target,
    subscribers: Vec<ResultSink>,
    started_at: Instant,
}

#[derive(Default)]
struct DedupInner {
    entries: HashMap<EntryId, InFlightEntry>,
    index: HashMap<Fingerprint, EntryId>,
    next_id: EntryId,
}

/// In-flight request table
#[derive(Default)]
pub struct Deduplicator {
    inner: Mutex<DedupInner>,
    leaders: AtomicU64,
    joins: AtomicU64,
    detached: AtomicU64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `sink` to the in-flight fetch for `op`, or start a new one.
    pub fn join(&self, op: &Operation, sink: ResultSink) -> Join {
        let fingerprint = op.fingerprint();
        let mut inner = self.inner.lock();

        if let Some(&id) = inner.index.get(&fingerprint) {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.subscribers.push(sink);
                self.joins.fetch_add(1, Ordering::Relaxed);
                prom::DEDUP_JOINS_TOTAL.inc();
                debug!(fingerprint = %fingerprint, subscribers = entry.subscribers.len(), "Joined in-flight read");
                return Join::Follower(id);
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            InFlightEntry {
                fingerprint,
                resource_id: op.resource_id().to_string(),
                target: op.target().clone(),
                subscribers: vec![sink],
                started_at: Instant::now(),
            },
        );
        inner.index.insert(fingerprint, id);
        self.leaders.fetch_add(1, Ordering::Relaxed);
        Join::Leader(id)
    }

    /// Resolve every subscriber of entry `id` with the same outcome and
    /// delete the entry. Returns the number of subscribers resolved.
    pub fn resolve(&self, id: EntryId, result: Result<Payload, OrchestratorError>) -> usize {
        let entry = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.remove(&id) else {
                return 0;
            };
            if inner.index.get(&entry.fingerprint) == Some(&id) {
                inner.index.remove(&entry.fingerprint);
            }
            entry
        };

        let count = entry.subscribers.len();
        debug!(
            fingerprint = %entry.fingerprint,
            subscribers = count,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "In-flight read resolved"
        );
        for sink in entry.subscribers {
            sink.resolve(result.clone());
        }
        count
    }

    /// Whether any subscriber of entry `id` still wants the result.
    pub fn has_interest(&self, id: EntryId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.subscribers.iter().any(|s| !s.is_cancelled()))
            .unwrap_or(false)
    }

    /// Stop new reads from joining in-flight fetches that overlap a write.
    pub fn detach_overlapping(&self, resource_id: &str, target: &Target) -> usize {
        let mut inner = self.inner.lock();
        let DedupInner { entries, index, .. } = &mut *inner;

        let before = index.len();
        index.retain(|_, id| {
            entries
                .get(id)
                .map(|e| e.resource_id != resource_id || !e.target.overlaps(target))
                .unwrap_or(false)
        });
        let detached = before - index.len();
        if detached > 0 {
            self.detached.fetch_add(detached as u64, Ordering::Relaxed);
            debug!(resource = resource_id, detached, "Detached in-flight reads");
        }
        detached
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn snapshot(&self) -> DedupStats {
        DedupStats {
            in_flight: self.in_flight(),
            leaders: self.leaders.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub in_flight: usize,
    pub leaders: u64,
    pub joins: u64,
    pub detached: u64,
}
