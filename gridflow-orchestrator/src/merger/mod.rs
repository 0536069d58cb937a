//! Read merging: overlapping range reads share one superset fetch.
//!
//! # Architecture
//!
//! ```text
//!   read [0,10)   read [5,15)   read [20,30)
//!        │             │             │
//!        ▼             ▼             ▼
//! ┌──────────────────────────────────────────┐
//! │ groups: (resource, sheet, args, scope)   │
//! │   ├── group 1: cover [0,15)  2 members   │ ← age timer / max_members
//! │   └── group 2: cover [20,30) 1 member    │
//! └────────────────────┬─────────────────────┘
//!                      │ flush
//!                      ▼
//!         executor: Read(cover) ──▶ slice per member
//! ```
//!
//! A range joins the first open group whose cover it can extend cheaply (see
//! [`MergerConfig::max_gap`] and [`MergerConfig::max_cover_ratio`]); anything
//! else opens a group of its own. Members whose callers have gone away are
//! dropped when the group is flushed, and a group with no remaining members is
//! never fetched.

mod config;
mod group;

pub use config::MergerConfig;
pub use group::{GroupKey, InterestProbe};

use gridflow_core::{Operation, OrchestratorError, Origin, Payload, Target};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::debug;

use crate::executor::{ParallelExecutor, UpstreamJob};
use crate::metrics::prometheus as prom;
use crate::upstream::{UpstreamCall, UpstreamReply};
use group::{distribute, MergeGroup, MergeMember, SealedGroup};

/// One member's share of a (possibly merged) fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRead {
    pub payload: Payload,
    pub validator: Option<String>,
}

#[derive(Debug, Default)]
struct MergerStats {
    reads: AtomicU64,
    groups: AtomicU64,
    merged_members: AtomicU64,
    withdrawn: AtomicU64,
    fetches: AtomicU64,
}

/// Groups concurrent range reads into superset fetches
pub struct RequestMerger {
    config: MergerConfig,
    executor: Arc<ParallelExecutor>,
    groups: Mutex<HashMap<GroupKey, Vec<MergeGroup>>>,
    next_group: AtomicU64,
    stats: MergerStats,
    this: Weak<RequestMerger>,
}

impl RequestMerger {
    pub fn new(config: MergerConfig, executor: Arc<ParallelExecutor>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            executor,
            groups: Mutex::new(HashMap::new()),
            next_group: AtomicU64::new(1),
            stats: MergerStats::default(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    /// Fetch the data for a read, sharing the upstream call with compatible
    /// reads that arrive within the window.
    ///
    /// Non-range targets and a disabled merger go straight to the executor.
    pub async fn fetch(
        &self,
        op: &Operation,
        interest: InterestProbe,
    ) -> Result<MergedRead, OrchestratorError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let range = match op.target() {
            Target::Range(range) if self.config.enabled && !range.is_empty() => range.clone(),
            _ => return self.fetch_direct(op).await,
        };

        let (tx, rx) = oneshot::channel();
        let member = MergeMember {
            range,
            reply: tx,
            interest,
            prefetch: op.origin() == Origin::Prefetch,
        };
        self.enqueue(op, member);

        rx.await.unwrap_or(Err(OrchestratorError::Cancelled))
    }

    fn enqueue(&self, op: &Operation, member: MergeMember) {
        let key = GroupKey {
            resource_id: op.resource_id().to_string(),
            sheet: member.range.sheet.clone(),
            args: op.args().clone(),
            scope: op.scope().to_string(),
        };

        let full = {
            let mut groups = self.groups.lock();
            let open = groups.entry(key.clone()).or_default();
            let position = open.iter().position(|g| {
                g.accepts(&member.range, self.config.max_gap, self.config.max_cover_ratio)
            });
            let full = match position {
                Some(i) => {
                    open[i].add(member, op.priority());
                    self.stats.merged_members.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        resource = op.resource_id(),
                        cover = %open[i].cover,
                        members = open[i].members.len(),
                        "Read joined merge group"
                    );
                    if open[i].members.len() >= self.config.max_members.max(1) {
                        Some(open.remove(i))
                    } else {
                        None
                    }
                }
                None => {
                    let group_id = self.next_group.fetch_add(1, Ordering::Relaxed);
                    let mut group = MergeGroup::open(group_id, member, op.priority());
                    if self.config.max_members <= 1 {
                        Some(group)
                    } else {
                        group.timer = Some(self.schedule(key.clone(), group_id));
                        open.push(group);
                        None
                    }
                }
            };
            if groups.get(&key).is_some_and(Vec::is_empty) {
                groups.remove(&key);
            }
            full
        };

        if let Some(group) = full {
            self.spawn_flush(key, group.seal());
        }
    }

    /// Age timer for one group, aborted if the group is flushed early.
    fn schedule(&self, key: GroupKey, group_id: u64) -> tokio::task::JoinHandle<()> {
        let weak = self.this.clone();
        let window = self.config.window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(merger) = weak.upgrade() {
                merger.flush_group(&key, group_id).await;
            }
        })
    }

    async fn flush_group(&self, key: &GroupKey, group_id: u64) {
        let group = {
            let mut groups = self.groups.lock();
            let Some(open) = groups.get_mut(key) else {
                return;
            };
            let Some(i) = open.iter().position(|g| g.group_id == group_id) else {
                return;
            };
            let mut group = open.remove(i);
            if open.is_empty() {
                groups.remove(key);
            }
            // This task is the timer; don't abort ourselves.
            group.timer = None;
            group
        };
        self.execute(key.clone(), group.seal()).await;
    }

    /// Flush every open group now. Used on shutdown.
    pub fn flush_all(&self) -> usize {
        let drained: Vec<(GroupKey, MergeGroup)> = {
            let mut groups = self.groups.lock();
            groups
                .drain()
                .flat_map(|(key, open)| open.into_iter().map(move |g| (key.clone(), g)))
                .collect()
        };
        let count = drained.len();
        for (key, group) in drained {
            self.spawn_flush(key, group.seal());
        }
        count
    }

    /// Open groups across all keys.
    pub fn open_groups(&self) -> usize {
        self.groups.lock().values().map(Vec::len).sum()
    }

    fn spawn_flush(&self, key: GroupKey, sealed: SealedGroup) {
        let Some(merger) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            merger.execute(key, sealed).await;
        });
    }

    async fn execute(&self, key: GroupKey, sealed: SealedGroup) {
        if sealed.withdrawn > 0 {
            self.stats.withdrawn.fetch_add(sealed.withdrawn as u64, Ordering::Relaxed);
        }
        let Some(cover) = sealed.cover() else {
            debug!(group = sealed.group_id, "Merge group withdrawn before flush");
            return;
        };
        let size = sealed.members.len();
        self.stats.groups.fetch_add(1, Ordering::Relaxed);
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        prom::MERGE_GROUP_SIZE.observe(size as f64);
        debug!(
            group = sealed.group_id,
            resource = %key.resource_id,
            cover = %cover,
            members = size,
            "Flushing merge group"
        );

        let call = UpstreamCall::Read {
            resource_id: key.resource_id.clone(),
            target: Target::Range(cover.clone()),
            args: key.args.clone(),
            validator: None,
        };
        let mut job = UpstreamJob::new(call, sealed.priority, key.scope.clone());
        if !sealed.retry() {
            job = job.without_retry();
        }

        match self.executor.execute(job).await {
            Ok(UpstreamReply::Data { payload, validator }) => {
                distribute(sealed.members, &cover, &payload, validator);
            }
            Ok(other) => {
                let err = unexpected_reply(&cover, &other);
                for member in sealed.members {
                    let _ = member.reply.send(Err(err.clone()));
                }
            }
            Err(err) => {
                for member in sealed.members {
                    let _ = member.reply.send(Err(err.clone()));
                }
            }
        }
    }

    async fn fetch_direct(&self, op: &Operation) -> Result<MergedRead, OrchestratorError> {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let call = UpstreamCall::Read {
            resource_id: op.resource_id().to_string(),
            target: op.target().clone(),
            args: op.args().clone(),
            validator: None,
        };
        let mut job = UpstreamJob::new(call, op.priority(), op.scope());
        if op.origin() == Origin::Prefetch {
            job = job.without_retry();
        }
        match self.executor.execute(job).await? {
            UpstreamReply::Data { payload, validator } => Ok(MergedRead { payload, validator }),
            other => Err(unexpected_reply(op.target(), &other)),
        }
    }

    pub fn snapshot(&self) -> MergerSnapshot {
        let reads = self.stats.reads.load(Ordering::Relaxed);
        let fetches = self.stats.fetches.load(Ordering::Relaxed);
        MergerSnapshot {
            reads,
            groups_flushed: self.stats.groups.load(Ordering::Relaxed),
            merged_members: self.stats.merged_members.load(Ordering::Relaxed),
            withdrawn: self.stats.withdrawn.load(Ordering::Relaxed),
            fetches,
            open_groups: self.open_groups(),
            fetches_saved: reads.saturating_sub(fetches),
        }
    }
}

fn unexpected_reply(target: &dyn std::fmt::Display, reply: &UpstreamReply) -> OrchestratorError {
    let kind = match reply {
        UpstreamReply::Data { .. } => "data",
        UpstreamReply::NotModified => "not_modified",
        UpstreamReply::Batch { .. } => "batch",
    };
    OrchestratorError::NonRetryable {
        endpoint: "read".to_string(),
        attempts: 1,
        message: format!("unexpected {} reply for read of {}", kind, target),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergerSnapshot {
    pub reads: u64,
    pub groups_flushed: u64,
    pub merged_members: u64,
    pub withdrawn: u64,
    pub fetches: u64,
    pub open_groups: usize,
    pub fetches_saved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{ConcurrencyCoordinator, CoordinatorConfig};
    use crate::executor::ExecutorConfig;
    use crate::resilience::{CircuitBreakerRegistry, CircuitConfig, RateLimitConfig, RateLimiter};
    use crate::upstream::MemoryUpstream;
    use gridflow_core::{GridRange, Priority};
    use serde_json::json;
    use std::time::Duration;

    fn merger(upstream: Arc<MemoryUpstream>, config: MergerConfig) -> Arc<RequestMerger> {
        let executor = Arc::new(ParallelExecutor::new(
            ExecutorConfig::default(),
            upstream,
            ConcurrencyCoordinator::new(&CoordinatorConfig::default()),
            Arc::new(CircuitBreakerRegistry::new(CircuitConfig::default())),
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
        ));
        RequestMerger::new(config, executor)
    }

    fn seeded() -> Arc<MemoryUpstream> {
        let upstream = Arc::new(MemoryUpstream::new());
        upstream.seed("doc", GridRange::rows("S", 0, 40), (0..40).map(|i| vec![json!(i)]).collect());
        upstream
    }

    fn rows(start: u32, end: u32) -> Payload {
        Payload::Values((start..end).map(|i| vec![json!(i)]).collect())
    }

    fn always() -> InterestProbe {
        Box::new(|| true)
    }

    #[tokio::test]
    async fn test_overlapping_reads_share_one_fetch() {
        let upstream = seeded();
        let merger = merger(upstream.clone(), MergerConfig::default());

        let a = Operation::read("doc", GridRange::rows("S", 0, 10));
        let b = Operation::read("doc", GridRange::rows("S", 5, 15));
        let c = Operation::read("doc", GridRange::rows("S", 20, 30));
        let (ra, rb, rc) = tokio::join!(
            merger.fetch(&a, always()),
            merger.fetch(&b, always()),
            merger.fetch(&c, always()),
        );

        assert_eq!(ra.unwrap().payload, rows(0, 10));
        assert_eq!(rb.unwrap().payload, rows(5, 15));
        assert_eq!(rc.unwrap().payload, rows(20, 30));
        assert_eq!(upstream.call_count("read"), 2);

        let targets: Vec<Target> = upstream.calls().into_iter().flat_map(|c| c.targets).collect();
        assert!(targets.contains(&Target::Range(GridRange::rows("S", 0, 15))));
        assert!(targets.contains(&Target::Range(GridRange::rows("S", 20, 30))));
    }

    #[tokio::test]
    async fn test_full_group_flushes_before_window() {
        let upstream = seeded();
        let config = MergerConfig { window_ms: 60_000, max_members: 2, ..Default::default() };
        let merger = merger(upstream.clone(), config);

        let a = Operation::read("doc", GridRange::rows("S", 0, 4));
        let b = Operation::read("doc", GridRange::rows("S", 2, 6));
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(merger.fetch(&a, always()), merger.fetch(&b, always()))
        })
        .await
        .expect("size trigger should flush without waiting for the window");

        assert_eq!(result.0.unwrap().payload, rows(0, 4));
        assert_eq!(result.1.unwrap().payload, rows(2, 6));
        assert_eq!(upstream.call_count("read"), 1);
        assert_eq!(merger.open_groups(), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_member_is_not_fetched() {
        let upstream = seeded();
        let merger = merger(upstream.clone(), MergerConfig::default());

        let op = Operation::read("doc", GridRange::rows("S", 0, 4));
        let result = merger.fetch(&op, Box::new(|| false)).await;
        assert_eq!(result, Err(OrchestratorError::Cancelled));
        assert_eq!(upstream.total_calls(), 0);
        assert_eq!(merger.snapshot().withdrawn, 1);
    }

    #[tokio::test]
    async fn test_different_args_are_not_merged() {
        let upstream = seeded();
        let merger = merger(upstream.clone(), MergerConfig::default());

        let a = Operation::read("doc", GridRange::rows("S", 0, 4));
        let b = Operation::read("doc", GridRange::rows("S", 2, 6)).with_arg("render", "formula");
        let (ra, rb) = tokio::join!(merger.fetch(&a, always()), merger.fetch(&b, always()));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(upstream.call_count("read"), 2);
    }

    #[tokio::test]
    async fn test_disabled_merger_reads_directly() {
        let upstream = seeded();
        let config = MergerConfig { enabled: false, ..Default::default() };
        let merger = merger(upstream.clone(), config);

        let a = Operation::read("doc", GridRange::rows("S", 0, 4)).with_priority(Priority::High);
        let b = Operation::read("doc", GridRange::rows("S", 2, 6));
        let (ra, rb) = tokio::join!(merger.fetch(&a, always()), merger.fetch(&b, always()));
        assert_eq!(ra.unwrap().payload, rows(0, 4));
        assert_eq!(rb.unwrap().payload, rows(2, 6));
        assert_eq!(upstream.call_count("read"), 2);
    }

    #[tokio::test]
    async fn test_flush_all_drains_open_groups() {
        let upstream = seeded();
        let config = MergerConfig { window_ms: 60_000, ..Default::default() };
        let merger = merger(upstream.clone(), config);

        let op = Operation::read("doc", GridRange::rows("S", 0, 4));
        let pending = {
            let merger = merger.clone();
            tokio::spawn(async move { merger.fetch(&op, always()).await })
        };
        while merger.open_groups() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(merger.flush_all(), 1);
        assert_eq!(pending.await.unwrap().unwrap().payload, rows(0, 4));
    }
}
