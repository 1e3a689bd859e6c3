//! PingBot - messaging-platform presence tracker
//!
//! Wires the engine together: storage, correlation, adapters, supervisor,
//! realtime fan-out and the HTTP surface, with an orderly shutdown path.

use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pingbot_backend::adapters::register_adapters;
use pingbot_backend::api::{self, AppState};
use pingbot_backend::config::Config;
use pingbot_backend::engine::{Classifier, Correlator, InsightsAggregator, SessionSupervisor};
use pingbot_backend::notify::{LogMailer, NotifyEdgeDetector};
use pingbot_backend::realtime::RealtimeFanout;
use pingbot_backend::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pingbot_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!("starting pingbot bind_addr={}", config.bind_addr);

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let correlator = Arc::new(Correlator::new(
        Classifier::from_config(&config.tracker),
        config.tracker.late_window_ms,
    ));
    let insights = Arc::new(InsightsAggregator::new(
        config.tracker.window_size,
        config.tracker.broadcast_interval_ms,
    ));
    let notifier = Arc::new(NotifyEdgeDetector::new(Arc::new(LogMailer)));
    let fanout = Arc::new(RealtimeFanout::new());
    let supervisor = Arc::new(SessionSupervisor::new());

    let (registry, whatsapp_service) = register_adapters(&config, store.clone());
    registry.init_all().await.context("start platform services")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        correlator,
        insights,
        notifier,
        fanout,
        registry,
        supervisor,
    });

    let app = api::router(state.clone(), whatsapp_service)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    info!("shutting down: stopping sessions");
    state.supervisor.stop_all().await;
    state.registry.shutdown_all().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
