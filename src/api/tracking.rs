//! Tracking control routes

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::engine::SessionRunner;
use crate::models::{ContactId, Platform, SessionKey, UserId};
use crate::notify::NotifyContext;
use crate::storage::ContactRow;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct StartStopRequest {
    pub user_id: UserId,
    pub contact_id: ContactId,
    pub platform: String,
}

#[derive(Debug, Deserialize)]
pub struct StopAllRequest {
    pub user_id: UserId,
    pub contact_id: ContactId,
}

fn notify_ctx(contact: &ContactRow) -> Option<NotifyContext> {
    let email = contact.notify_email.clone()?;
    let label = if contact.display_name.is_empty() {
        contact.target.clone()
    } else {
        contact.display_name.clone()
    };
    Some(NotifyContext {
        user_email: email,
        contact_label: label,
        contact_target: contact.target.clone(),
        platform: contact.platform,
        notify_enabled: contact.notify_online,
    })
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartStopRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(platform) = Platform::parse(&req.platform) else {
        return Err((StatusCode::BAD_REQUEST, format!("unknown platform {}", req.platform)));
    };
    if !state.registry.supports(platform) {
        return Err((StatusCode::BAD_REQUEST, format!("platform {platform} not enabled")));
    }

    let contact = state
        .store
        .get_contact(req.user_id, req.contact_id)
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "contact not found".to_string()))?;

    let adapter = state
        .registry
        .create(platform, req.user_id, req.contact_id)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let key = SessionKey::new(req.user_id, req.contact_id, platform);
    let runner = SessionRunner::new(
        key,
        adapter,
        state.correlator.clone(),
        state.store.clone(),
        state.fanout.clone(),
        state.insights.clone(),
        state.notifier.clone(),
        notify_ctx(&contact),
        state.config.tracker.clone(),
    );

    state.supervisor.start(key, move |stop_rx| runner.run(stop_rx)).await;

    Ok(Json(json!({ "ok": true, "running": true })))
}

fn drop_session_state(state: &AppState, key: SessionKey) {
    state.correlator.drop_session(key);
    state.insights.drop_session(key);
    state.notifier.drop_session(key);
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartStopRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(platform) = Platform::parse(&req.platform) else {
        return Err((StatusCode::BAD_REQUEST, format!("unknown platform {}", req.platform)));
    };
    let key = SessionKey::new(req.user_id, req.contact_id, platform);
    state.supervisor.stop(key).await;
    drop_session_state(&state, key);
    Ok(Json(json!({ "ok": true, "running": false })))
}

pub async fn stop_all(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopAllRequest>,
) -> Json<Value> {
    state.supervisor.stop_all_for_contact(req.user_id, req.contact_id).await;
    for platform in [Platform::Signal, Platform::Whatsapp, Platform::WhatsappWeb, Platform::Mock] {
        drop_session_state(&state, SessionKey::new(req.user_id, req.contact_id, platform));
    }
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub user_id: UserId,
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatusQuery>,
) -> Json<Value> {
    let running: HashMap<String, Vec<String>> = state
        .supervisor
        .list_running(q.user_id)
        .into_iter()
        .map(|(contact_id, platforms)| (contact_id.to_string(), platforms))
        .collect();
    Json(json!({ "running": running }))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    warn!("tracking route error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}
