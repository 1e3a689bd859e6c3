//! Signal receive engine
//!
//! One long-lived loop per process: websocket first, HTTP polling when the
//! handshake is refused, exponential back-off on disconnects (1 s doubling
//! to 30 s, reset on success). Receipt envelopes carry `when` plus the
//! timestamps of the original sent messages; each timestamp is resolved
//! against the durable probe index and fanned out to the session queue.

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
use crate::config::SignalConfig;
use crate::models::{ContactId, Platform, UserId};
use crate::storage::ProbeStore;

use super::client::SignalRestClient;

/// Below this a timestamp is almost certainly seconds in modern epoch time.
const MS_EPOCH_FLOOR: i64 = 1_000_000_000_000;

pub fn normalize_ts_ms(ts: i64) -> i64 {
    if ts < MS_EPOCH_FLOOR {
        ts * 1000
    } else {
        ts
    }
}

/// Plausible unit renderings of one message timestamp, tried in order
/// against the probe index to absorb sec-vs-ms mismatches on either side.
pub fn ts_candidates(ts: i64) -> Vec<i64> {
    let ms = normalize_ts_ms(ts);
    let mut out = vec![ms, ms / 1000, ms.saturating_mul(1000)];
    out.dedup();
    out.retain(|c| *c > 0 && *c < 10_000_000_000_000_000);
    out
}

fn as_int(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// A receipt envelope stripped down to what correlation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReceipt {
    pub kind: ReceiptKind,
    pub when_ms: i64,
    pub message_timestamps: Vec<i64>,
}

/// Parse one incoming frame. Frames that are not delivery/read receipts
/// resolve to `None`.
pub fn parse_receipt_frame(raw: &str) -> Option<ParsedReceipt> {
    let msg: Value = serde_json::from_str(raw).ok()?;

    // Sometimes the frame is { envelope: {...} }, sometimes it IS the envelope.
    let env = msg.get("envelope").filter(|e| e.is_object()).unwrap_or(&msg);
    let receipt = env.get("receiptMessage")?.as_object()?;

    let is_delivery = receipt.get("isDelivery").and_then(Value::as_bool).unwrap_or(false);
    let is_read = receipt.get("isRead").and_then(Value::as_bool).unwrap_or(false);
    let kind = if is_delivery {
        ReceiptKind::Delivered
    } else if is_read {
        ReceiptKind::Read
    } else {
        return None;
    };

    let when_ms = normalize_ts_ms(as_int(receipt.get("when")).unwrap_or(0));

    let mut message_timestamps = Vec::new();
    if let Some(Value::Array(list)) = receipt.get("timestamps") {
        for t in list {
            if let Some(ti) = as_int(Some(t)) {
                message_timestamps.push(ti);
            }
        }
    } else if let Some(single) =
        as_int(receipt.get("timestamp")).or_else(|| as_int(receipt.get("sentTimestamp")))
    {
        message_timestamps.push(single);
    }

    if message_timestamps.is_empty() {
        return None;
    }

    Some(ParsedReceipt { kind, when_ms, message_timestamps })
}

pub struct SignalReceiptService {
    cfg: SignalConfig,
    store: Arc<dyn ProbeStore>,
    queues: SessionQueues,
    backoff_max: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalReceiptService {
    pub fn new(cfg: SignalConfig, store: Arc<dyn ProbeStore>, queue_cap: usize, backoff_max: Duration) -> Self {
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

    /// Resolve every message timestamp of one receipt and publish the hits.
    fn handle_receipt(&self, parsed: &ParsedReceipt) {
        for ts in &parsed.message_timestamps {
            let candidates = ts_candidates(*ts);
            let row = match self.store.find_by_platform_ts(Platform::Signal, &candidates) {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(e) => {
                    warn!("signal probe lookup failed: {}", e);
                    continue;
                }
            };

            let mark = match parsed.kind {
                ReceiptKind::Delivered => self.store.mark_delivered(&row.probe_id, parsed.when_ms),
                ReceiptKind::Read => self.store.mark_read(&row.probe_id, parsed.when_ms),
            };
            if let Err(e) = mark {
                warn!("signal receipt persist failed probe_id={}: {}", row.probe_id, e);
            }

            self.queues.publish(ResolvedReceipt {
                user_id: row.user_id,
                contact_id: row.contact_id,
                probe_id: row.probe_id,
                kind: parsed.kind,
                when_ms: parsed.when_ms,
                platform_message_id: Some(normalize_ts_ms(*ts).to_string()),
            });
        }
    }

    fn handle_incoming(&self, raw: &str) {
        if let Some(parsed) = parse_receipt_frame(raw) {
            self.handle_receipt(&parsed);
        }
    }

    async fn run_ws(&self, client: &SignalRestClient) -> Result<()> {
        let url = self.cfg.ws_url(client.account());
        info!("connecting signal ws url={}", url);
        let (ws, _) = connect_async(&url).await.context("signal ws handshake")?;
        let (_, mut read) = ws.split();

        while let Some(frame) = read.next().await {
            match frame.context("signal ws read")? {
                tungstenite::Message::Text(text) => self.handle_incoming(&text),
                tungstenite::Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        self.handle_incoming(&text);
                    }
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn run_http_poll(&self, client: &SignalRestClient) -> Result<()> {
        info!("polling signal receive base={}", self.cfg.rest_base);
        loop {
            let envelopes = client.receive_http_once().await?;
            for env in envelopes {
                if let Ok(raw) = serde_json::to_string(&env) {
                    self.handle_incoming(&raw);
                }
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    async fn run_loop(self: Arc<Self>, client: SignalRestClient) {
        let mut backoff = Duration::from_secs(1);
        let mut use_ws_first = true;

        loop {
            let result = if use_ws_first {
                self.run_ws(&client).await
            } else {
                self.run_http_poll(&client).await
            };

            match result {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    let handshake_refused = e
                        .chain()
                        .any(|c| matches!(c.downcast_ref::<tungstenite::Error>(), Some(tungstenite::Error::Http(_))));
                    if use_ws_first && handshake_refused {
                        // Normal/native mode install: receive is poll-only.
                        warn!("signal ws not available; falling back to http polling");
                        use_ws_first = false;
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    warn!("signal receive disconnected: {}", e);
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
    }
}

#[async_trait]
impl PlatformService for Arc<SignalReceiptService> {
    async fn start_all(&self) -> Result<()> {
        if !self.cfg.enabled {
            info!("signal disabled");
            return Ok(());
        }
        if self.cfg.account.is_none() {
            warn!("signal enabled but SIGNAL_ACCOUNT missing");
            return Ok(());
        }

        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return Ok(());
        }
        let client = SignalRestClient::new(&self.cfg)?;
        let service = Arc::clone(self);
        *task = Some(tokio::spawn(service.run_loop(client)));
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
    fn normalizes_seconds_to_ms() {
        assert_eq!(normalize_ts_ms(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_ts_ms(1_700_000_000_123), 1_700_000_000_123);
    }

    #[test]
    fn candidates_cover_unit_mismatches() {
        let c = ts_candidates(1_700_000_000_123);
        assert!(c.contains(&1_700_000_000_123));
        assert!(c.contains(&1_700_000_000));
        assert!(c.contains(&1_700_000_000_123_000));
    }

    #[test]
    fn parses_delivery_receipt() {
        let raw = r#"{
            "envelope": {
                "receiptMessage": {
                    "isDelivery": true,
                    "isRead": false,
                    "when": 1700000000123,
                    "timestamps": [1700000000000]
                }
            }
        }"#;
        let parsed = parse_receipt_frame(raw).unwrap();
        assert_eq!(parsed.kind, ReceiptKind::Delivered);
        assert_eq!(parsed.when_ms, 1_700_000_000_123);
        assert_eq!(parsed.message_timestamps, vec![1_700_000_000_000]);
    }

    #[test]
    fn parses_bare_envelope_with_read_receipt() {
        let raw = r#"{
            "receiptMessage": {
                "isDelivery": false,
                "isRead": true,
                "when": 1700000000,
                "timestamp": "1700000000000"
            }
        }"#;
        let parsed = parse_receipt_frame(raw).unwrap();
        assert_eq!(parsed.kind, ReceiptKind::Read);
        // seconds-flavoured `when` is normalized
        assert_eq!(parsed.when_ms, 1_700_000_000_000);
        assert_eq!(parsed.message_timestamps, vec![1_700_000_000_000]);
    }

    #[test]
    fn ignores_non_receipt_frames() {
        assert!(parse_receipt_frame(r#"{"envelope":{"dataMessage":{"message":"hi"}}}"#).is_none());
        assert!(parse_receipt_frame("not json").is_none());
        assert!(
            parse_receipt_frame(r#"{"envelope":{"receiptMessage":{"isDelivery":false,"isRead":false,"when":1,"timestamps":[2]}}}"#)
                .is_none()
        );
    }

    #[test]
    fn receipt_without_timestamps_is_dropped() {
        let raw = r#"{"envelope":{"receiptMessage":{"isDelivery":true,"when":1700000000123,"timestamps":[]}}}"#;
        assert!(parse_receipt_frame(raw).is_none());
    }
}
