//! WhatsApp webhook intake
//!
//! Meta's handshake and signed event delivery:
//! - GET with `hub.mode=subscribe` echoes `hub.challenge` when the verify
//!   token matches.
//! - POST carries `X-Hub-Signature-256: sha256=<hex>`, an HMAC-SHA256 over
//!   the raw body keyed with the app secret; comparison is constant-time.
//!
//! Status updates live under `entry[].changes[].value.statuses[]`; their
//! timestamps are unix seconds.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::adapters::{ReceiptKind, ResolvedReceipt};
use crate::models::Platform;
use crate::storage::ProbeStore;

use super::service::WhatsAppReceiptService;

type HmacSha256 = Hmac<Sha256>;

/// One status entry pulled out of a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message_id: String,
    pub status: String,
    pub when_ms: Option<i64>,
}

/// Constant-time verification of Meta's `sha256=<hex>` header. A missing
/// app secret disables verification.
pub fn verify_signature(app_secret: Option<&str>, raw_body: &[u8], header_value: Option<&str>) -> bool {
    let Some(secret) = app_secret else {
        return true;
    };
    let Some(header) = header_value else {
        return false;
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest.trim()) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Walk `entry[].changes[].value.statuses[]`.
pub fn extract_statuses(payload: &Value) -> Vec<StatusUpdate> {
    let mut out = Vec::new();
    let Some(entries) = payload.get("entry").and_then(Value::as_array) else {
        return out;
    };
    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(Value::as_array) else {
            continue;
        };
        for change in changes {
            let Some(statuses) = change
                .get("value")
                .and_then(|v| v.get("statuses"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for st in statuses {
                let (Some(message_id), Some(status)) = (
                    st.get("id").and_then(Value::as_str),
                    st.get("status").and_then(Value::as_str),
                ) else {
                    continue;
                };
                // unix seconds, usually as a string
                let when_ms = match st.get("timestamp") {
                    Some(Value::String(s)) => s.trim().parse::<i64>().ok().map(|s| s * 1000),
                    Some(Value::Number(n)) => n.as_i64().map(|s| s * 1000),
                    _ => None,
                };
                out.push(StatusUpdate {
                    message_id: message_id.to_string(),
                    status: status.to_string(),
                    when_ms,
                });
            }
        }
    }
    out
}

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
    pub store: Arc<dyn ProbeStore>,
    pub service: Arc<WhatsAppReceiptService>,
}

/// GET /webhooks/whatsapp — Meta's challenge handshake.
pub async fn verify(
    State(state): State<WebhookState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    let token_ok = match (&state.verify_token, token) {
        (Some(expected), Some(got)) => expected == got,
        _ => false,
    };

    if mode == Some("subscribe") && token_ok {
        (StatusCode::OK, challenge).into_response()
    } else {
        (StatusCode::FORBIDDEN, "verification failed").into_response()
    }
}

/// POST /webhooks/whatsapp — signed status events.
pub async fn receive(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());

    if !verify_signature(state.app_secret.as_deref(), &body, signature) {
        warn!("whatsapp webhook bad signature");
        return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid json").into_response(),
    };

    for st in extract_statuses(&payload) {
        apply_status(&state, &st);
    }

    (StatusCode::OK, axum::Json(serde_json::json!({"ok": true}))).into_response()
}

fn apply_status(state: &WebhookState, st: &StatusUpdate) {
    let row = match state
        .store
        .find_by_platform_message_id(Platform::Whatsapp, &st.message_id)
    {
        Ok(Some(row)) => row,
        Ok(None) => {
            debug!("whatsapp status for unknown message_id={}", st.message_id);
            return;
        }
        Err(e) => {
            warn!("whatsapp probe lookup failed: {}", e);
            return;
        }
    };

    let Some(when_ms) = st.when_ms else {
        return;
    };

    let kind = match st.status.as_str() {
        "delivered" => {
            let _ = state.store.mark_delivered(&row.probe_id, when_ms);
            ReceiptKind::Delivered
        }
        "read" => {
            let _ = state.store.mark_read(&row.probe_id, when_ms);
            ReceiptKind::Read
        }
        _ => return,
    };

    state.service.publish(ResolvedReceipt {
        user_id: row.user_id,
        contact_id: row.contact_id,
        probe_id: row.probe_id,
        kind,
        when_ms,
        platform_message_id: Some(st.message_id.clone()),
    });
}
