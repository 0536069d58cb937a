//! Prefetch candidate queue.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;

use super::predictor::PrefetchCandidate;

/// Candidates ordered by confidence, highest first, with bounded size.
pub struct PrefetchQueue {
    candidates: Mutex<VecDeque<PrefetchCandidate>>,
    max_size: usize,
}

impl PrefetchQueue {
    pub fn new(max_size: usize) -> Self {
        Self { candidates: Mutex::new(VecDeque::with_capacity(max_size)), max_size: max_size.max(1) }
    }

    /// Add a candidate.
    ///
    /// Returns false if an identical read is already queued or the queue is
    /// full of candidates at least as confident.
    pub async fn push(&self, candidate: PrefetchCandidate) -> bool {
        let mut candidates = self.candidates.lock().await;
        let fingerprint = candidate.operation.fingerprint();
        if candidates.iter().any(|c| c.operation.fingerprint() == fingerprint) {
            return false;
        }

        if candidates.len() >= self.max_size {
            match candidates.back() {
                Some(last) if candidate.confidence > last.confidence => {
                    candidates.pop_back();
                }
                _ => return false,
            }
        }

        let pos = candidates
            .iter()
            .position(|c| c.confidence < candidate.confidence)
            .unwrap_or(candidates.len());
        candidates.insert(pos, candidate);
        true
    }

    pub async fn pop(&self) -> Option<PrefetchCandidate> {
        self.candidates.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.candidates.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.candidates.lock().await.is_empty()
    }

    /// Remove candidates older than `max_age`
    pub async fn remove_expired(&self, max_age: Duration) -> usize {
        let mut candidates = self.candidates.lock().await;
        let before = candidates.len();
        candidates.retain(|c| c.age() < max_age);
        before - candidates.len()
    }

    pub async fn clear(&self) -> usize {
        let mut candidates = self.candidates.lock().await;
        let count = candidates.len();
        candidates.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::{GridRange, Operation};
    use std::time::Instant;

    fn candidate(start: u32, confidence: f64) -> PrefetchCandidate {
        PrefetchCandidate {
            operation: Operation::read("doc", GridRange::rows("S", start, start + 10)),
            confidence,
            created_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_push_and_pop_by_confidence() {
        let queue = PrefetchQueue::new(10);
        queue.push(candidate(0, 0.5)).await;
        queue.push(candidate(10, 0.8)).await;
        queue.push(candidate(20, 0.3)).await;

        assert_eq!(queue.len().await, 3);
        assert!((queue.pop().await.unwrap().confidence - 0.8).abs() < 1e-9);
        assert!((queue.pop().await.unwrap().confidence - 0.5).abs() < 1e-9);
        assert!((queue.pop().await.unwrap().confidence - 0.3).abs() < 1e-9);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = PrefetchQueue::new(2);
        assert!(queue.push(candidate(0, 0.5)).await);
        assert!(queue.push(candidate(10, 0.6)).await);

        // Full: a weaker candidate is rejected, a stronger one evicts the weakest
        assert!(!queue.push(candidate(20, 0.4)).await);
        assert!(queue.push(candidate(30, 0.9)).await);
        assert_eq!(queue.len().await, 2);
        assert!((queue.pop().await.unwrap().confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicates_are_rejected() {
        let queue = PrefetchQueue::new(10);
        assert!(queue.push(candidate(0, 0.5)).await);
        assert!(!queue.push(candidate(0, 0.9)).await);
    }

    #[tokio::test]
    async fn test_remove_expired() {
        let queue = PrefetchQueue::new(10);
        queue.push(candidate(0, 0.5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.remove_expired(Duration::from_millis(10)).await, 1);
        assert_eq!(queue.clear().await, 0);
    }
}
