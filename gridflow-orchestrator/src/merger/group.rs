//! Merge group accumulation and cover planning.

use gridflow_core::{GridRange, OrchestratorError, Payload, Priority};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::MergedRead;

/// Returns `false` once nobody is waiting for a member's result.
pub type InterestProbe = Box<dyn Fn() -> bool + Send + Sync>;

/// Reads that may share one fetch: same resource, sheet, args and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub resource_id: String,
    pub sheet: String,
    pub args: BTreeMap<String, String>,
    pub scope: String,
}

pub(crate) struct MergeMember {
    pub range: GridRange,
    pub reply: oneshot::Sender<Result<MergedRead, OrchestratorError>>,
    pub interest: InterestProbe,
    pub prefetch: bool,
}

impl MergeMember {
    pub fn is_wanted(&self) -> bool {
        !self.reply.is_closed() && (self.interest)()
    }
}

/// An open group waiting for its window to close.
pub(crate) struct MergeGroup {
    pub group_id: u64,
    pub cover: GridRange,
    pub members: Vec<MergeMember>,
    pub opened_at: Instant,
    pub priority: Priority,
    pub timer: Option<JoinHandle<()>>,
}

impl MergeGroup {
    pub fn open(group_id: u64, member: MergeMember, priority: Priority) -> Self {
        Self {
            group_id,
            cover: member.range.clone(),
            members: vec![member],
            opened_at: Instant::now(),
            priority,
            timer: None,
        }
    }

    /// Whether `range` can be folded into this group's cover cheaply.
    pub fn accepts(&self, range: &GridRange, max_gap: u32, max_cover_ratio: f64) -> bool {
        let Some(gap) = self.cover.gap(range) else {
            return false;
        };
        if gap > max_gap {
            return false;
        }
        let cover = self.cover.cover(range);
        let requested = self.cover.area().saturating_add(range.area());
        cover.area() as f64 <= max_cover_ratio * requested as f64
    }

    pub fn add(&mut self, member: MergeMember, priority: Priority) {
        self.cover = self.cover.cover(&member.range);
        self.priority = self.priority.max(priority);
        self.members.push(member);
    }

    /// Detach the members for execution, stopping the age timer.
    pub fn seal(mut self) -> SealedGroup {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let total = self.members.len();
        let members: Vec<MergeMember> = self.members.into_iter().filter(MergeMember::is_wanted).collect();
        let withdrawn = total - members.len();
        SealedGroup { group_id: self.group_id, members, withdrawn, priority: self.priority }
    }
}

pub(crate) struct SealedGroup {
    pub group_id: u64,
    pub members: Vec<MergeMember>,
    pub withdrawn: usize,
    pub priority: Priority,
}

impl SealedGroup {
    /// Cover of the members that are still wanted.
    pub fn cover(&self) -> Option<GridRange> {
        self.members.iter().map(|m| m.range.clone()).reduce(|a, b| a.cover(&b))
    }

    /// A group made only of prefetches gets a single attempt.
    pub fn retry(&self) -> bool {
        self.members.iter().any(|m| !m.prefetch)
    }
}

/// Carve a cover result into per-member results.
pub(crate) fn distribute(
    members: Vec<MergeMember>,
    cover: &GridRange,
    payload: &Payload,
    validator: Option<String>,
) {
    for member in members {
        let result = match payload.slice(cover, &member.range) {
            Some(part) => Ok(MergedRead { payload: part, validator: validator.clone() }),
            None => Err(OrchestratorError::NonRetryable {
                endpoint: "read".to_string(),
                attempts: 1,
                message: format!("result for {} cannot be sliced to {}", cover, member.range),
            }),
        };
        let _ = member.reply.send(result);
    }
}
