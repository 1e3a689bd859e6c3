//! Realtime fan-out
//!
//! Per-user set of subscriber handles. Events are serialized once and
//! pushed to every subscriber; a failed send marks the subscriber dead and
//! it is pruned after the loop. Subscriber lifecycle is driven by the
//! stream transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{StreamEvent, UserId};

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct RealtimeFanout {
    next_id: AtomicU64,
    by_user: Mutex<HashMap<UserId, Vec<Subscriber>>>,
}

impl RealtimeFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; the transport owns the receiving half.
    pub fn connect(&self, user_id: UserId) -> (SubscriberId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut by_user = self.by_user.lock();
        let subs = by_user.entry(user_id).or_default();
        subs.push(Subscriber { id, tx });
        debug!("stream connected user_id={} conns={}", user_id, subs.len());
        (id, rx)
    }

    pub fn disconnect(&self, user_id: UserId, id: SubscriberId) {
        let mut by_user = self.by_user.lock();
        if let Some(subs) = by_user.get_mut(&user_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                by_user.remove(&user_id);
            }
        }
        debug!("stream disconnected user_id={}", user_id);
    }

    /// Serialize once, send to every subscriber of the user, prune the dead.
    pub fn broadcast_to_user(&self, user_id: UserId, event: &StreamEvent) {
        let message = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                warn!("stream event serialization failed: {}", e);
                return;
            }
        };

        let mut by_user = self.by_user.lock();
        let Some(subs) = by_user.get_mut(&user_id) else {
            return;
        };

        let before = subs.len();
        subs.retain(|s| s.tx.send(message.clone()).is_ok());
        if subs.len() < before {
            debug!("pruned {} dead stream subscribers user_id={}", before - subs.len(), user_id);
        }
        if subs.is_empty() {
            by_user.remove(&user_id);
        }
    }

    pub fn client_count(&self, user_id: UserId) -> usize {
        self.by_user.lock().get(&user_id).map(|s| s.len()).unwrap_or(0)
    }
}
