//! Per-contact Signal adapter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::{Adapter, AdapterProbe, AdapterReceipt};
use crate::models::{now_ms, ContactId, UserId, PRIMARY_DEVICE};
use crate::storage::SqliteStore;

use super::client::SignalRestClient;
use super::service::{normalize_ts_ms, SignalReceiptService};

/// Zero-width space: the probe is invisible in the recipient's chat.
const PROBE_BODY: &str = "\u{200B}";

fn as_int(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Pull the sent-message timestamp out of a send response; the location
/// varies across signal-cli versions.
pub fn extract_message_ts(resp: &Value) -> Option<i64> {
    for key in ["timestamp", "messageTimestamp", "sentTimestamp"] {
        if let Some(ts) = as_int(resp.get(key)) {
            return Some(ts);
        }
    }
    if let Some(Value::Array(results)) = resp.get("results") {
        if let Some(r0) = results.first() {
            for key in ["timestamp", "messageTimestamp", "sentTimestamp"] {
                if let Some(ts) = as_int(r0.get(key)) {
                    return Some(ts);
                }
            }
        }
    }
    None
}

pub struct SignalAdapter {
    user_id: UserId,
    contact_id: ContactId,
    service: Arc<SignalReceiptService>,
    client: SignalRestClient,
    directory: Arc<SqliteStore>,
    relay: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalAdapter {
    pub fn new(
        user_id: UserId,
        contact_id: ContactId,
        service: Arc<SignalReceiptService>,
        client: SignalRestClient,
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
            bail!("contact not found for signal adapter user_id={} contact_id={}", self.user_id, self.contact_id);
        };
        Ok(contact.target)
    }
}

#[async_trait]
impl Adapter for SignalAdapter {
    async fn send_probe(&self) -> Result<AdapterProbe> {
        let recipient = self.recipient()?;
        let probe_id = Uuid::new_v4().simple().to_string();
        let sent_at_ms = now_ms();

        let resp = self.client.send_text(&recipient, PROBE_BODY).await?;

        let raw_ts = extract_message_ts(&resp);
        let msg_ts_ms = raw_ts.map(normalize_ts_ms).unwrap_or(sent_at_ms);

        // Retract the probe with an empty reaction; not every install
        // supports the endpoint, so failures are ignored.
        if let Some(ts) = raw_ts {
            let _ = self.client.send_reaction(&recipient, ts, "").await;
        }

        Ok(AdapterProbe {
            probe_id,
            sent_at_ms,
            platform_message_id: None,
            platform_message_ts: Some(msg_ts_ms),
            send_response: Some(resp),
        })
    }

    async fn receipts(&self) -> Result<mpsc::Receiver<AdapterReceipt>> {
        let mut relay = self.relay.lock();
        if relay.is_some() {
            bail!("signal receipt stream already taken");
        }

        let mut service_rx = self.service.subscribe(self.user_id, self.contact_id);
        let (tx, rx) = mpsc::channel(1024);

        // Delivery or read both count as ACK for RTT; installs vary.
        *relay = Some(tokio::spawn(async move {
            while let Some(ev) = service_rx.recv().await {
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
