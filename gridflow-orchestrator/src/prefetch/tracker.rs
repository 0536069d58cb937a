//! Bounded per-resource access history.

use gridflow_core::{Operation, OperationKind, Target};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Resources with a tracked history.
const MAX_TRACKED_RESOURCES: usize = 1024;

/// One resolved operation, as seen by the predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessEvent {
    pub resource_id: String,
    pub kind: OperationKind,
    pub target: Target,
    pub args: BTreeMap<String, String>,
    pub scope: String,
    pub timestamp: Instant,
}

impl AccessEvent {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            resource_id: op.resource_id().to_string(),
            kind: op.kind(),
            target: op.target().clone(),
            args: op.args().clone(),
            scope: op.scope().to_string(),
            timestamp: Instant::now(),
        }
    }
}

/// Keeps the most recent events per resource, capped by count and age.
pub struct AccessPatternTracker {
    histories: Mutex<LruCache<String, VecDeque<AccessEvent>>>,
    history_size: usize,
    history_age: Duration,
}

impl AccessPatternTracker {
    pub fn new(history_size: usize, history_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_RESOURCES).unwrap_or(NonZeroUsize::MIN);
        Self { histories: Mutex::new(LruCache::new(capacity)), history_size: history_size.max(1), history_age }
    }

    /// Append an event and return the resource's current history, oldest first.
    pub fn record(&self, event: AccessEvent) -> Vec<AccessEvent> {
        let mut histories = self.histories.lock();
        let key = event.resource_id.clone();
        if !histories.contains(&key) {
            histories.put(key.clone(), VecDeque::with_capacity(self.history_size));
        }
        let Some(history) = histories.get_mut(&key) else {
            return Vec::new();
        };

        history.push_back(event);
        while history.len() > self.history_size {
            history.pop_front();
        }
        let now = Instant::now();
        while history.front().is_some_and(|e| now.duration_since(e.timestamp) > self.history_age) {
            history.pop_front();
        }
        history.iter().cloned().collect()
    }

    pub fn history(&self, resource_id: &str) -> Vec<AccessEvent> {
        self.histories
            .lock()
            .peek(resource_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_resources(&self) -> usize {
        self.histories.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::GridRange;

    fn read(start: u32) -> AccessEvent {
        AccessEvent::from_operation(&Operation::read("doc", GridRange::rows("S", start, start + 10)))
    }

    #[test]
    fn test_history_is_size_capped() {
        let tracker = AccessPatternTracker::new(3, Duration::from_secs(60));
        for i in 0..5 {
            tracker.record(read(i * 10));
        }
        let history = tracker.history("doc");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], AccessEvent { timestamp: history[0].timestamp, ..read(20) });
    }

    #[test]
    fn test_history_is_age_capped() {
        let tracker = AccessPatternTracker::new(10, Duration::from_millis(10));
        tracker.record(read(0));
        std::thread::sleep(Duration::from_millis(20));
        let history = tracker.record(read(10));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_resources_are_tracked_separately() {
        let tracker = AccessPatternTracker::new(10, Duration::from_secs(60));
        tracker.record(read(0));
        tracker.record(AccessEvent::from_operation(&Operation::read("other", Target::Whole)));
        assert_eq!(tracker.tracked_resources(), 2);
        assert_eq!(tracker.history("doc").len(), 1);
        assert!(tracker.history("missing").is_empty());
    }
}
