//! Per-contact WhatsApp Web bridge adapter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapters::{Adapter, AdapterProbe, AdapterReceipt};
use crate::config::WhatsAppWebConfig;
use crate::models::{now_ms, ContactId, UserId, PRIMARY_DEVICE};
use crate::storage::SqliteStore;

use super::service::WhatsAppWebReceiptService;

pub struct WhatsAppWebAdapter {
    user_id: UserId,
    contact_id: ContactId,
    service: Arc<WhatsAppWebReceiptService>,
    http: reqwest::Client,
    bridge_base: String,
    directory: Arc<SqliteStore>,
    relay: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WhatsAppWebAdapter {
    pub fn new(
        user_id: UserId,
        contact_id: ContactId,
        service: Arc<WhatsAppWebReceiptService>,
        cfg: &WhatsAppWebConfig,
        directory: Arc<SqliteStore>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("build waweb http client")?;
        Ok(Self {
            user_id,
            contact_id,
            service,
            http,
            bridge_base: cfg.bridge_base.trim_end_matches('/').to_string(),
            directory,
            relay: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn recipient(&self) -> Result<String> {
        let Some(contact) = self.directory.get_contact(self.user_id, self.contact_id)? else {
            bail!("contact not found for waweb adapter user_id={} contact_id={}", self.user_id, self.contact_id);
        };
        Ok(contact.target)
    }
}

#[async_trait]
impl Adapter for WhatsAppWebAdapter {
    async fn send_probe(&self) -> Result<AdapterProbe> {
        let recipient = self.recipient()?;
        let probe_id = Uuid::new_v4().simple().to_string();
        let sent_at_ms = now_ms();

        let resp = self
            .http
            .post(format!("{}/send", self.bridge_base))
            .json(&json!({ "to": recipient, "text": format!("[probe:{probe_id}] ping") }))
            .send()
            .await
            .context("waweb send request")?
            .error_for_status()
            .context("waweb send status")?;
        let data: Value = resp.json().await.context("waweb send response body")?;

        let message_id = data
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(AdapterProbe {
            probe_id,
            sent_at_ms,
            platform_message_id: message_id,
            // The bridge keys updates on message id; the timestamp column
            // still gets the send time so ts lookups stay possible.
            platform_message_ts: Some(sent_at_ms),
            send_response: Some(data),
        })
    }

    async fn receipts(&self) -> Result<mpsc::Receiver<AdapterReceipt>> {
        let mut relay = self.relay.lock();
        if relay.is_some() {
            bail!("waweb receipt stream already taken");
        }

        let mut service_rx = self.service.subscribe(self.user_id, self.contact_id);
        let (tx, rx) = mpsc::channel(1024);

        *relay = Some(tokio::spawn(async move {
            while let Some(ev) = service_rx.recv().await {
                let receipt = AdapterReceipt {
                    probe_id: ev.probe_id,
                    device_id: PRIMARY_DEVICE.to_string(),
                    received_at_ms: if ev.when_ms > 0 { ev.when_ms } else { now_ms() },
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
