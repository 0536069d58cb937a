//! Global priority-aware admission gate.
//!
//! Every upstream call, whichever subsystem issues it (batch flush, merge
//! flush, dedup leader, prefetch), holds a [`ConcurrencyPermit`] for its
//! duration. There is exactly one coordinator per orchestrator.
//!
//! # Architecture
//!
//! ```text
//!   acquire(HIGH)   acquire(MEDIUM)   acquire(LOW)
//!        │                │                │
//!  ┌─────▼─────┐   ┌──────▼─────┐   ┌──────▼─────┐
//!  │ HIGH FIFO │   │ MEDIUM FIFO│   │  LOW FIFO  │
//!  └─────┬─────┘   └──────┬─────┘   └──────┬─────┘
//!        └────────────────┼────────────────┘
//!                  ┌──────▼──────┐
//!                  │  dispatch   │ ← strict tier order, LOW only when idle
//!                  └──────┬──────┘
//!                         │ max_concurrent slots
//!                         ▼
//!                      upstream
//! ```
//!
//! Waiters park on a oneshot channel; a released slot is handed straight to
//! the next eligible waiter. LOW waiters only take idle capacity: they are
//! admitted while no HIGH or MEDIUM work is active or queued.

use gridflow_core::{OrchestratorError, Priority};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

use crate::metrics::prometheus as prom;

const LOW: usize = 2;

/// Configuration for the admission gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of upstream calls in flight at once
    pub max_concurrent: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct SlotState {
    max_concurrent: usize,
    active: [usize; 3],
    queues: [VecDeque<Waiter>; 3],
    closed: bool,
    next_id: u64,
}

impl SlotState {
    fn total_active(&self) -> usize {
        self.active.iter().sum()
    }

    /// Hand free slots to eligible waiters.
    fn dispatch(&mut self) {
        while self.total_active() < self.max_concurrent {
            let Some(tier) = (0..3).find(|&t| !self.queues[t].is_empty()) else {
                break;
            };
            if tier == LOW && self.active[0] + self.active[1] > 0 {
                break;
            }
            let Some(waiter) = self.queues[tier].pop_front() else {
                break;
            };
            // A closed receiver means the waiter gave up; skip it.
            if waiter.tx.send(()).is_ok() {
                self.active[tier] += 1;
            }
        }
        self.publish();
    }

    fn publish(&self) {
        for priority in Priority::ALL {
            prom::set_queue_depth(priority.as_str(), self.queues[priority.tier()].len());
        }
        prom::COORDINATOR_ACTIVE.set(self.total_active() as f64);
    }
}

struct Shared {
    state: Mutex<SlotState>,
    idle: Notify,
    admitted: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Shared {
    fn release(&self, tier: usize) {
        let now_idle = {
            let mut state = self.state.lock();
            state.active[tier] = state.active[tier].saturating_sub(1);
            state.dispatch();
            state.total_active() == 0
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }
}

/// The single shared admission gate.
#[derive(Clone)]
pub struct ConcurrencyCoordinator {
    shared: Arc<Shared>,
}

impl ConcurrencyCoordinator {
    pub fn new(config: &CoordinatorConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SlotState {
                    max_concurrent,
                    active: [0; 3],
                    queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    closed: false,
                    next_id: 0,
                }),
                idle: Notify::new(),
                admitted: AtomicU64::new(0),
                total_wait_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a slot. Never busy-waits; fails only after [`close`](Self::close).
    ///
    /// Dropping the returned future before it resolves withdraws from the
    /// queue, and releases the slot if it had already been granted.
    pub async fn acquire(&self, priority: Priority) -> Result<ConcurrencyPermit, OrchestratorError> {
        let tier = priority.tier();
        let started = Instant::now();

        let (id, rx) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(OrchestratorError::Shutdown);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_id;
            state.next_id += 1;
            state.queues[tier].push_back(Waiter { id, tx });
            state.dispatch();
            (id, rx)
        };

        let mut guard = WaitGuard { shared: &self.shared, tier, id, rx, armed: true };
        let granted = (&mut guard.rx).await.is_ok();
        guard.armed = false;

        if !granted {
            return Err(OrchestratorError::Shutdown);
        }

        let waited = started.elapsed();
        self.shared.admitted.fetch_add(1, Ordering::Relaxed);
        self.shared
            .total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        prom::COORDINATOR_WAIT_SECONDS.observe(waited.as_secs_f64());
        debug!(priority = %priority, wait_ms = waited.as_millis() as u64, "Slot acquired");

        Ok(ConcurrencyPermit { shared: Arc::clone(&self.shared), tier })
    }

    /// Reject new acquisitions and drop queued waiters. Held permits stay valid.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped: usize = state.queues.iter().map(VecDeque::len).sum();
        for queue in state.queues.iter_mut() {
            queue.clear();
        }
        state.publish();
        info!(dropped_waiters = dropped, "Coordinator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Resolve once no permit is held.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.state.lock().total_active() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.shared.state.lock();
        let admitted = self.shared.admitted.load(Ordering::Relaxed);
        let total_wait = self.shared.total_wait_ms.load(Ordering::Relaxed);
        CoordinatorSnapshot {
            max_concurrent: state.max_concurrent,
            active: state.total_active(),
            queued_high: state.queues[0].len(),
            queued_medium: state.queues[1].len(),
            queued_low: state.queues[LOW].len(),
            admitted,
            avg_wait_ms: if admitted == 0 { 0.0 } else { total_wait as f64 / admitted as f64 },
        }
    }
}

/// Withdraws a waiter whose `acquire` future was dropped.
struct WaitGuard<'a> {
    shared: &'a Shared,
    tier: usize,
    id: u64,
    rx: oneshot::Receiver<()>,
    armed: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let granted = {
            let mut state = self.shared.state.lock();
            let queue = &mut state.queues[self.tier];
            match queue.iter().position(|w| w.id == self.id) {
                Some(pos) => {
                    queue.remove(pos);
                    state.publish();
                    false
                }
                // Grants are sent under the lock, so a missing waiter was either
                // granted or dropped by `close`.
                None => self.rx.try_recv().is_ok(),
            }
        };
        if granted {
            // The slot was handed over but never claimed.
            self.shared.release(self.tier);
        }
    }
}

/// A held concurrency slot. Released on drop.
pub struct ConcurrencyPermit {
    shared: Arc<Shared>,
    tier: usize,
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit").field("tier", &self.tier).finish()
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.shared.release(self.tier);
    }
}

/// Point-in-time view of the gate
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub max_concurrent: usize,
    pub active: usize,
    pub queued_high: usize,
    pub queued_medium: usize,
    pub queued_low: usize,
    pub admitted: u64,
    pub avg_wait_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator(max: usize) -> ConcurrencyCoordinator {
        ConcurrencyCoordinator::new(&CoordinatorConfig { max_concurrent: max })
    }

    #[tokio::test]
    async fn test_acquire_within_capacity() {
        let gate = coordinator(2);
        let a = gate.acquire(Priority::Medium).await.unwrap();
        let _b = gate.acquire(Priority::Low).await.unwrap();
        assert_eq!(gate.snapshot().active, 2);
        drop(a);
        assert_eq!(gate.snapshot().active, 1);
    }

    #[tokio::test]
    async fn test_high_before_medium_fifo_within_tier() {
        let gate = coordinator(1);
        let held = gate.acquire(Priority::High).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for (label, priority) in [("m1", Priority::Medium), ("h1", Priority::High), ("m2", Priority::Medium), ("h2", Priority::High)] {
            let gate = gate.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire(priority).await.unwrap();
                order.lock().push(label);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
            tokio::task::yield_now().await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["h1", "h2", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_low_waits_for_all_high_work() {
        let gate = coordinator(2);
        let h1 = gate.acquire(Priority::High).await.unwrap();
        let h2 = gate.acquire(Priority::High).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("h3", Priority::High),
            ("h4", Priority::High),
            ("h5", Priority::High),
        ] {
            let gate = gate.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire(priority).await.unwrap();
                order.lock().push(format!("start:{}", label));
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().push(format!("end:{}", label));
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(gate.snapshot().queued_low, 1);

        drop(h1);
        drop(h2);
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock();
        let low_start = order.iter().position(|e| e == "start:low").unwrap();
        for h in ["h3", "h4", "h5"] {
            let end = order.iter().position(|e| *e == format!("end:{}", h)).unwrap();
            assert!(end < low_start, "{} finished after low started: {:?}", h, order);
        }
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_slot() {
        let gate = coordinator(1);
        let held = gate.acquire(Priority::High).await.unwrap();

        let pending = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(Priority::High).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        pending.abort();
        let _ = pending.await;

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(100), gate.acquire(Priority::Low))
            .await
            .expect("slot should be free");
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_close_rejects_new_and_drains() {
        let gate = coordinator(1);
        let held = gate.acquire(Priority::Medium).await.unwrap();
        gate.close();

        assert_eq!(gate.acquire(Priority::High).await.unwrap_err(), OrchestratorError::Shutdown);

        let drained = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_millis(100), drained)
            .await
            .expect("drained should resolve")
            .unwrap();
    }
}
