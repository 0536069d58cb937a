//! Batch windows and sealed batches.

use gridflow_core::{Operation, Priority, Target};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::lane::Ticket;
use super::FlushTrigger;
use crate::sink::ResultSink;

/// Writes that may share one batch call: same resource and credential scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub resource_id: String,
    pub scope: String,
}

pub(crate) struct PendingWrite {
    pub op: Operation,
    pub sink: ResultSink,
}

/// An open accumulator for one [`WindowKey`].
pub(crate) struct BatchWindow {
    pub window_id: Uuid,
    pub writes: Vec<PendingWrite>,
    pub opened_at: Instant,
    pub timer: Option<JoinHandle<()>>,
}

impl BatchWindow {
    pub fn open() -> Self {
        Self { window_id: Uuid::new_v4(), writes: Vec::new(), opened_at: Instant::now(), timer: None }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Close the window. The age timer is aborted unless it is the caller.
    pub fn seal(mut self, key: WindowKey, trigger: FlushTrigger, ticket: Ticket) -> SealedBatch {
        if let Some(timer) = self.timer.take() {
            if trigger != FlushTrigger::Age {
                timer.abort();
            }
        }
        SealedBatch {
            window_id: self.window_id,
            key,
            writes: self.writes,
            trigger,
            ticket,
            age: self.opened_at.elapsed(),
        }
    }
}

pub(crate) struct SealedBatch {
    pub window_id: Uuid,
    pub key: WindowKey,
    pub writes: Vec<PendingWrite>,
    pub trigger: FlushTrigger,
    pub ticket: Ticket,
    pub age: Duration,
}

/// Highest priority among the members; the batch call is admitted at it.
pub(crate) fn batch_priority(writes: &[PendingWrite]) -> Priority {
    writes.iter().map(|w| w.op.priority()).max().unwrap_or_default()
}

/// A failed sub-write may be re-sent on its own only if no later member of the
/// batch touches the same cells; otherwise the retry would land after it.
pub(crate) fn can_retry_alone(targets: &[&Target], index: usize) -> bool {
    let Some(target) = targets.get(index) else {
        return false;
    };
    !targets[index + 1..].iter().any(|later| later.overlaps(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::GridRange;

    #[test]
    fn test_retry_alone_only_without_later_overlap() {
        let a: Target = GridRange::rows("S", 0, 5).into();
        let b: Target = GridRange::rows("S", 10, 15).into();
        let c: Target = GridRange::rows("S", 3, 4).into();
        let targets = vec![&a, &b, &c];

        assert!(!can_retry_alone(&targets, 0));
        assert!(can_retry_alone(&targets, 1));
        assert!(can_retry_alone(&targets, 2));
        assert!(!can_retry_alone(&targets, 3));
    }

    #[test]
    fn test_selector_blocks_retry_of_earlier_ranges() {
        let a: Target = GridRange::rows("S", 0, 5).into();
        let props = Target::Selector("properties".into());
        assert!(!can_retry_alone(&[&a, &props], 0));
    }
}
