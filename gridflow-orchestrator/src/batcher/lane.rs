//! Per-resource write lanes.
//!
//! Every sealed batch takes a ticket from its resource's lane and waits until
//! the lane is serving that ticket, so batches for one resource reach the
//! upstream strictly in the order they were sealed.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

struct Lane {
    next_ticket: u64,
    serving: watch::Sender<u64>,
}

/// Position of one sealed batch in its resource's lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub resource_id: String,
    pub number: u64,
}

#[derive(Default)]
pub(crate) struct WriteLanes {
    lanes: Mutex<HashMap<String, Lane>>,
}

impl WriteLanes {
    pub fn issue(&self, resource_id: &str) -> Ticket {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(resource_id.to_string()).or_insert_with(|| Lane {
            next_ticket: 0,
            serving: watch::channel(0).0,
        });
        let number = lane.next_ticket;
        lane.next_ticket += 1;
        Ticket { resource_id: resource_id.to_string(), number }
    }

    /// Wait until `ticket` is being served. The returned turn advances the
    /// lane when dropped.
    pub async fn wait_turn(&self, ticket: Ticket) -> LaneTurn<'_> {
        let receiver = self.lanes.lock().get(&ticket.resource_id).map(|l| l.serving.subscribe());
        if let Some(mut receiver) = receiver {
            let number = ticket.number;
            // A closed lane has nothing left in front of us.
            let _ = receiver.wait_for(|serving| *serving >= number).await;
        }
        LaneTurn { lanes: self, ticket: Some(ticket) }
    }

    fn complete(&self, ticket: &Ticket) {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(&ticket.resource_id) else {
            return;
        };
        let next = ticket.number + 1;
        lane.serving.send_replace(next);
        if next >= lane.next_ticket {
            lanes.remove(&ticket.resource_id);
        }
    }

    /// Wait until every batch sealed so far for `resource_id` has finished.
    pub async fn wait_idle(&self, resource_id: &str) {
        let pending = self
            .lanes
            .lock()
            .get(resource_id)
            .map(|lane| (lane.serving.subscribe(), lane.next_ticket));
        if let Some((mut receiver, upto)) = pending {
            let _ = receiver.wait_for(|serving| *serving >= upto).await;
        }
    }

    pub fn resources(&self) -> Vec<String> {
        self.lanes.lock().keys().cloned().collect()
    }
}

/// Holding the lane for one batch.
pub(crate) struct LaneTurn<'a> {
    lanes: &'a WriteLanes,
    ticket: Option<Ticket>,
}

impl Drop for LaneTurn<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.lanes.complete(&ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_turns_follow_ticket_order() {
        let lanes = Arc::new(WriteLanes::default());
        let first = lanes.issue("doc");
        let second = lanes.issue("doc");
        let order = Arc::new(Mutex::new(Vec::new()));

        let waiter = {
            let lanes = lanes.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _turn = lanes.wait_turn(second).await;
                order.lock().push(2);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(order.lock().is_empty());

        {
            let _turn = lanes.wait_turn(first).await;
            order.lock().push(1);
        }
        waiter.await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
        assert!(lanes.resources().is_empty());
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let lanes = WriteLanes::default();
        let _a = lanes.issue("a");
        let b = lanes.issue("b");
        // "b" must not wait behind "a"
        let turn = tokio::time::timeout(Duration::from_millis(100), lanes.wait_turn(b)).await;
        assert!(turn.is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_outstanding_batches() {
        let lanes = Arc::new(WriteLanes::default());
        let ticket = lanes.issue("doc");
        let idle = {
            let lanes = lanes.clone();
            tokio::spawn(async move { lanes.wait_idle("doc").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!idle.is_finished());

        drop(lanes.wait_turn(ticket).await);
        idle.await.unwrap();
        lanes.wait_idle("unknown").await;
    }
}
