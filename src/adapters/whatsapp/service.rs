//! WhatsApp receipt service
//!
//! Webhook-driven: there is no receive loop to run, the webhook handlers
//! publish resolved receipts into the per-session queues after correlating
//! against the probe index.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::adapters::registry::PlatformService;
use crate::adapters::{ResolvedReceipt, SessionQueues};
use crate::models::{ContactId, UserId};

pub struct WhatsAppReceiptService {
    queues: SessionQueues,
}

impl WhatsAppReceiptService {
    pub fn new(queue_cap: usize) -> Self {
        Self {
            queues: SessionQueues::new(queue_cap),
        }
    }

    pub fn subscribe(&self, user_id: UserId, contact_id: ContactId) -> tokio::sync::mpsc::Receiver<ResolvedReceipt> {
        self.queues.subscribe(user_id, contact_id)
    }

    pub fn unsubscribe(&self, user_id: UserId, contact_id: ContactId) {
        self.queues.unsubscribe(user_id, contact_id);
    }

    pub fn publish(&self, ev: ResolvedReceipt) {
        self.queues.publish(ev);
    }
}

#[async_trait]
impl PlatformService for std::sync::Arc<WhatsAppReceiptService> {
    async fn start_all(&self) -> Result<()> {
        info!("whatsapp service ready");
        Ok(())
    }

    async fn stop_all(&self) {
        self.queues.clear();
    }
}
