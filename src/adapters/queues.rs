//! Per-session receipt queues
//!
//! Every platform receipt service owns one of these: a bounded queue per
//! (user, contact) that the session's adapter drains. The receive loop is
//! the single producer; overflow drops the event so a slow runner cannot
//! build unbounded backlog.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::adapters::ResolvedReceipt;
use crate::models::{ContactId, UserId};

pub struct SessionQueues {
    capacity: usize,
    queues: Mutex<HashMap<(UserId, ContactId), mpsc::Sender<ResolvedReceipt>>>,
}

impl SessionQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Open the session's queue. A re-subscribe replaces the previous
    /// sender, which closes the old receiver.
    pub fn subscribe(&self, user_id: UserId, contact_id: ContactId) -> mpsc::Receiver<ResolvedReceipt> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.queues.lock().insert((user_id, contact_id), tx);
        rx
    }

    pub fn unsubscribe(&self, user_id: UserId, contact_id: ContactId) {
        self.queues.lock().remove(&(user_id, contact_id));
    }

    /// Non-blocking publish; drops on overflow or when nobody subscribed.
    pub fn publish(&self, ev: ResolvedReceipt) {
        let tx = {
            let queues = self.queues.lock();
            match queues.get(&(ev.user_id, ev.contact_id)) {
                Some(tx) => tx.clone(),
                None => return,
            }
        };
        if let Err(e) = tx.try_send(ev) {
            match e {
                mpsc::error::TrySendError::Full(ev) => warn!(
                    "receipt queue full; dropping user_id={} contact_id={}",
                    ev.user_id, ev.contact_id
                ),
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    pub fn clear(&self) {
        self.queues.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ReceiptKind;

    fn receipt(probe: &str) -> ResolvedReceipt {
        ResolvedReceipt {
            user_id: 1,
            contact_id: 2,
            probe_id: probe.into(),
            kind: ReceiptKind::Delivered,
            when_ms: 100,
            platform_message_id: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let q = SessionQueues::new(8);
        let mut rx = q.subscribe(1, 2);
        q.publish(receipt("p1"));
        assert_eq!(rx.recv().await.unwrap().probe_id, "p1");
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let q = SessionQueues::new(8);
        q.publish(receipt("p1"));
        // no panic, nothing to assert beyond not blocking
    }

    #[tokio::test]
    async fn overflow_drops_newest() {
        let q = SessionQueues::new(1);
        let mut rx = q.subscribe(1, 2);
        q.publish(receipt("p1"));
        q.publish(receipt("p2"));
        assert_eq!(rx.recv().await.unwrap().probe_id, "p1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribe_closes_previous_receiver() {
        let q = SessionQueues::new(8);
        let mut old = q.subscribe(1, 2);
        let mut new = q.subscribe(1, 2);
        q.publish(receipt("p1"));
        assert!(old.recv().await.is_none());
        assert_eq!(new.recv().await.unwrap().probe_id, "p1");
    }
}
