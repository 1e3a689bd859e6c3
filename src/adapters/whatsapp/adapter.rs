//! Per-contact WhatsApp Cloud adapter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::{Adapter, AdapterProbe, AdapterReceipt, ReceiptKind};
use crate::models::{now_ms, ContactId, UserId, PRIMARY_DEVICE};
use crate::storage::SqliteStore;

use super::client::{extract_message_id, WhatsAppClient};
use super::service::WhatsAppReceiptService;

/// Observed id prefixes of real client-generated message ids.
const MSG_ID_PREFIXES: &[&str] = &["3EB0", "BAE5", "F1D2", "A9C4", "7E8B", "C3F9", "2D6A"];

/// A random message id shaped like a client-generated one, for the fake
/// delete frame.
pub fn random_message_id() -> String {
    let mut rng = rand::thread_rng();
    let prefix = MSG_ID_PREFIXES.choose(&mut rng).copied().unwrap_or("3EB0");
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let suffix: String = (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{prefix}{suffix}")
}

pub struct WhatsAppAdapter {
    user_id: UserId,
    contact_id: ContactId,
    service: Arc<WhatsAppReceiptService>,
    client: WhatsAppClient,
    directory: Arc<SqliteStore>,
    relay: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WhatsAppAdapter {
    pub fn new(
        user_id: UserId,
        contact_id: ContactId,
        service: Arc<WhatsAppReceiptService>,
        client: WhatsAppClient,
        directory: Arc<SqliteStore>,
    ) -> Self {
        Self {
            user_id,
            contact_id,
            service,
            client,
            directory,
            relay: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn recipient(&self) -> Result<String> {
        let Some(contact) = self.directory.get_contact(self.user_id, self.contact_id)? else {
            bail!("contact not found for whatsapp adapter user_id={} contact_id={}", self.user_id, self.contact_id);
        };
        Ok(contact.target)
    }
}

#[async_trait]
impl Adapter for WhatsAppAdapter {
    async fn send_probe(&self) -> Result<AdapterProbe> {
        let recipient = self.recipient()?;
        let probe_id = Uuid::new_v4().simple().to_string();
        let fake_id = random_message_id();
        let sent_at_ms = now_ms();

        // Delete frame for a message that never existed: invisible to the
        // recipient, still acked with delivery statuses. Falls back to a
        // tagged text message when the install rejects raw frames.
        let resp = match self.client.send_delete(&recipient, &fake_id).await {
            Ok(resp) => resp,
            Err(_) => {
                self.client
                    .send_text(&recipient, &format!("[delete_probe:{probe_id}:{fake_id}]"))
                    .await?
            }
        };

        let message_id = extract_message_id(&resp).unwrap_or_else(|| fake_id.clone());

        Ok(AdapterProbe {
            probe_id,
            sent_at_ms,
            platform_message_id: Some(message_id),
            platform_message_ts: None,
            send_response: Some(resp),
        })
    }

    async fn receipts(&self) -> Result<mpsc::Receiver<AdapterReceipt>> {
        let mut relay = self.relay.lock();
        if relay.is_some() {
            bail!("whatsapp receipt stream already taken");
        }

        let mut service_rx = self.service.subscribe(self.user_id, self.contact_id);
        let (tx, rx) = mpsc::channel(1024);

        // Only delivery is the RTT ack here; reads persist to the probe
        // row but do not resolve the probe a second time.
        *relay = Some(tokio::spawn(async move {
            while let Some(ev) = service_rx.recv().await {
                if ev.kind != ReceiptKind::Delivered {
                    continue;
                }
                let receipt = AdapterReceipt {
                    probe_id: ev.probe_id,
                    device_id: PRIMARY_DEVICE.to_string(),
                    received_at_ms: ev.when_ms,
                    status: "delivered".to_string(),
                    platform_message_id: ev.platform_message_id,
                };
                if tx.send(receipt).await.is_err() {
                    break;
                }
            }
        }));

        Ok(rx)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.service.unsubscribe(self.user_id, self.contact_id);
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_have_known_prefix_shape() {
        for _ in 0..50 {
            let id = random_message_id();
            assert_eq!(id.len(), 12);
            assert!(MSG_ID_PREFIXES.iter().any(|p| id.starts_with(p)));
            assert!(id
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn random_ids_are_not_constant() {
        let a = random_message_id();
        let b = random_message_id();
        let c = random_message_id();
        assert!(a != b || b != c);
    }
}
