//! HTTP surface
//!
//! The minimal set of routes the engine needs: tracking control for the
//! supervisor, the realtime stream endpoint, the WhatsApp webhook intake
//! and a health probe. Authentication is a collaborator concern; the
//! user_id parameters are the seam where its middleware plugs in.

pub mod stream;
pub mod tracking;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::adapters::whatsapp::webhook::{self, WebhookState};
use crate::adapters::whatsapp::WhatsAppReceiptService;
use crate::adapters::AdapterRegistry;
use crate::config::Config;
use crate::engine::{Correlator, InsightsAggregator, SessionSupervisor};
use crate::notify::NotifyEdgeDetector;
use crate::realtime::RealtimeFanout;
use crate::storage::SqliteStore;

/// Shared handles for every route handler and the runner factories.
pub struct AppState {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub correlator: Arc<Correlator>,
    pub insights: Arc<InsightsAggregator>,
    pub notifier: Arc<NotifyEdgeDetector>,
    pub fanout: Arc<RealtimeFanout>,
    pub registry: Arc<AdapterRegistry>,
    pub supervisor: Arc<SessionSupervisor>,
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: Arc<AppState>, whatsapp_service: Arc<WhatsAppReceiptService>) -> Router {
    let webhook_state = WebhookState {
        verify_token: state.config.whatsapp.verify_token.clone(),
        app_secret: state.config.whatsapp.app_secret.clone(),
        store: state.store.clone(),
        service: whatsapp_service,
    };

    let webhooks = Router::new()
        .route("/webhooks/whatsapp", get(webhook::verify).post(webhook::receive))
        .with_state(webhook_state);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(stream::ws_endpoint))
        .route("/api/tracking/start", post(tracking::start))
        .route("/api/tracking/stop", post(tracking::stop))
        .route("/api/tracking/stop_all", post(tracking::stop_all))
        .route("/api/tracking/status", get(tracking::status))
        .with_state(state)
        .merge(webhooks)
}
