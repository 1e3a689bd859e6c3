//! WhatsApp Web bridge receive engine
//!
//! Connects to the bridge websocket and resolves `wa:update` frames to
//! probes via the message-id index. Any update counts as delivered for
//! now; mapping Baileys ack levels onto delivered vs read can come later.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{info, warn};

use crate::adapters::registry::PlatformService;
use crate::adapters::{ReceiptKind, ResolvedReceipt, SessionQueues};
use crate::config::WhatsAppWebConfig;
use crate::models::{now_ms, ContactId, Platform, UserId};
use crate::storage::ProbeStore;

/// A `wa:update` frame stripped to what correlation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeUpdate {
    pub message_id: String,
    pub when_ms: i64,
}

/// Parse one bridge frame; anything that is not a `wa:update` is ignored.
pub fn parse_bridge_frame(raw: &str) -> Option<BridgeUpdate> {
    let msg: Value = serde_json::from_str(raw).ok()?;
    if msg.get("type").and_then(Value::as_str) != Some("wa:update") {
        return None;
    }
    let message_id = msg.get("message_id")?.as_str()?.to_string();
    let when_ms = msg.get("ts").and_then(Value::as_i64).unwrap_or(0);
    Some(BridgeUpdate { message_id, when_ms })
}

pub struct WhatsAppWebReceiptService {
    cfg: WhatsAppWebConfig,
    store: Arc<dyn ProbeStore>,
    queues: SessionQueues,
    backoff_max: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WhatsAppWebReceiptService {
    pub fn new(cfg: WhatsAppWebConfig, store: Arc<dyn ProbeStore>, queue_cap: usize, backoff_max: Duration) -> Self {
        Self {
            cfg,
            store,
            queues: SessionQueues::new(queue_cap),
            backoff_max,
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, user_id: UserId, contact_id: ContactId) -> tokio::sync::mpsc::Receiver<ResolvedReceipt> {
        self.queues.subscribe(user_id, contact_id)
    }

    pub fn unsubscribe(&self, user_id: UserId, contact_id: ContactId) {
        self.queues.unsubscribe(user_id, contact_id);
    }

    fn handle_update(&self, update: &BridgeUpdate) {
        let row = match self
            .store
            .find_by_platform_message_id(Platform::WhatsappWeb, &update.message_id)
        {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                warn!("waweb probe lookup failed: {}", e);
                return;
            }
        };

        let when_ms = if update.when_ms > 0 { update.when_ms } else { now_ms() };
        if let Err(e) = self.store.mark_delivered(&row.probe_id, when_ms) {
            warn!("waweb receipt persist failed probe_id={}: {}", row.probe_id, e);
        }

        self.queues.publish(ResolvedReceipt {
            user_id: row.user_id,
            contact_id: row.contact_id,
            probe_id: row.probe_id,
            kind: ReceiptKind::Delivered,
            when_ms,
            platform_message_id: Some(update.message_id.clone()),
        });
    }

    async fn run_ws(&self) -> Result<()> {
        info!("connecting waweb bridge ws url={}", self.cfg.bridge_ws);
        let (ws, _) = connect_async(&self.cfg.bridge_ws).await.context("waweb ws handshake")?;
        let (_, mut read) = ws.split();

        while let Some(frame) = read.next().await {
            match frame.context("waweb ws read")? {
                tungstenite::Message::Text(text) => {
                    if let Some(update) = parse_bridge_frame(&text) {
                        self.handle_update(&update);
                    }
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.run_ws().await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!("waweb ws disconnected: {}", e);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
    }
}

#[async_trait]
impl PlatformService for Arc<WhatsAppWebReceiptService> {
    async fn start_all(&self) -> Result<()> {
        if !self.cfg.enabled {
            info!("whatsapp_web disabled");
            return Ok(());
        }
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        let service = Arc::clone(self);
        *task = Some(tokio::spawn(service.run_loop()));
        info!("whatsapp_web service started");
        Ok(())
    }

    async fn stop_all(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_frame() {
        let raw = r#"{"type":"wa:update","message_id":"3EB0AAAA1111","ts":1700000000123}"#;
        let update = parse_bridge_frame(raw).unwrap();
        assert_eq!(update.message_id, "3EB0AAAA1111");
        assert_eq!(update.when_ms, 1_700_000_000_123);
    }

    #[test]
    fn ignores_other_frames() {
        assert!(parse_bridge_frame(r#"{"type":"wa:qr","data":"..."}"#).is_none());
        assert!(parse_bridge_frame(r#"{"type":"wa:update"}"#).is_none());
        assert!(parse_bridge_frame("garbage").is_none());
    }

    #[test]
    fn missing_ts_defaults_to_zero() {
        let raw = r#"{"type":"wa:update","message_id":"id1"}"#;
        assert_eq!(parse_bridge_frame(raw).unwrap().when_ms, 0);
    }
}
