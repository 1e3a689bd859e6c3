//! End-to-end engine tests
//!
//! Drive a full session through the supervisor with a scripted adapter:
//! probes go out on a short cadence, receipts (or silence) come back, and
//! the assertions run against the persisted points, the realtime stream
//! and the notification count.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use pingbot_backend::adapters::{Adapter, AdapterProbe, AdapterReceipt};
use pingbot_backend::config::TrackerConfig;
use pingbot_backend::engine::{
    Classifier, Correlator, InsightsAggregator, SessionRunner, SessionSupervisor,
};
use pingbot_backend::models::{
    now_ms, DeviceState, Platform, SessionKey, PRIMARY_DEVICE,
};
use pingbot_backend::notify::{Mailer, NotifyContext, NotifyEdgeDetector};
use pingbot_backend::realtime::RealtimeFanout;
use pingbot_backend::storage::{ProbeStore, SqliteStore};

/// Per-probe plan: `Some(delay_ms)` answers after the delay, `None` stays
/// silent so the probe times out. An exhausted plan answers like the last
/// entry says nothing: silence.
struct ScriptedAdapter {
    plan: Mutex<VecDeque<Option<u64>>>,
    tx: mpsc::Sender<AdapterReceipt>,
    rx: Mutex<Option<mpsc::Receiver<AdapterReceipt>>>,
    pending: Mutex<JoinSet<()>>,
}

impl ScriptedAdapter {
    fn new(plan: Vec<Option<u64>>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(Self {
            plan: Mutex::new(plan.into()),
            tx,
            rx: Mutex::new(Some(rx)),
            pending: Mutex::new(JoinSet::new()),
        })
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn send_probe(&self) -> Result<AdapterProbe> {
        let probe_id = Uuid::new_v4().simple().to_string();
        let sent_at_ms = now_ms();

        let step = self.plan.lock().pop_front().flatten();
        if let Some(delay_ms) = step {
            let tx = self.tx.clone();
            let probe = probe_id.clone();
            self.pending.lock().spawn(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                let _ = tx
                    .send(AdapterReceipt {
                        probe_id: probe,
                        device_id: PRIMARY_DEVICE.to_string(),
                        received_at_ms: now_ms(),
                        status: "delivered".to_string(),
                        platform_message_id: None,
                    })
                    .await;
            });
        }

        Ok(AdapterProbe {
            probe_id,
            sent_at_ms,
            platform_message_id: None,
            platform_message_ts: None,
            send_response: None,
        })
    }

    async fn receipts(&self) -> Result<mpsc::Receiver<AdapterReceipt>> {
        match self.rx.lock().take() {
            Some(rx) => Ok(rx),
            None => bail!("receipt stream already taken"),
        }
    }

    async fn close(&self) {
        self.pending.lock().abort_all();
    }
}

struct CountingMailer(AtomicUsize);

impl Mailer for CountingMailer {
    fn send(&self, _to: &str, _subject: &str, _body: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    key: SessionKey,
    store: Arc<SqliteStore>,
    fanout: Arc<RealtimeFanout>,
    supervisor: Arc<SessionSupervisor>,
    mails: Arc<CountingMailer>,
}

impl Harness {
    fn config() -> TrackerConfig {
        TrackerConfig {
            timeout_ms: 80,
            base_interval_s: 0.1,
            jitter_s: 0.0,
            streak_backoff_1_s: 0.1,
            streak_backoff_s: 0.1,
            broadcast_interval_ms: 0,
            ..TrackerConfig::default()
        }
    }

    async fn start(adapter: Arc<dyn Adapter>, notify_enabled: bool) -> Self {
        let key = SessionKey::new(1, 2, Platform::Mock);
        let cfg = Self::config();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let fanout = Arc::new(RealtimeFanout::new());
        let mails = Arc::new(CountingMailer(AtomicUsize::new(0)));
        let supervisor = Arc::new(SessionSupervisor::new());

        let notify_ctx = NotifyContext {
            user_email: "me@example.com".into(),
            contact_label: "Marc".into(),
            contact_target: "+491234".into(),
            platform: Platform::Mock,
            notify_enabled,
        };

        let runner = SessionRunner::new(
            key,
            adapter,
            Arc::new(Correlator::new(Classifier::from_config(&cfg), cfg.late_window_ms)),
            store.clone() as Arc<dyn ProbeStore>,
            fanout.clone(),
            Arc::new(InsightsAggregator::new(cfg.window_size, cfg.broadcast_interval_ms)),
            Arc::new(NotifyEdgeDetector::new(mails.clone())),
            Some(notify_ctx),
            cfg,
        );

        supervisor.start(key, move |stop_rx| runner.run(stop_rx)).await;

        Self { key, store, fanout, supervisor, mails }
    }

    async fn stop(&self) {
        self.supervisor.stop(self.key).await;
    }

    fn points_chronological(&self) -> Vec<pingbot_backend::models::TrackerPoint> {
        let mut points = self
            .store
            .recent_points(self.key.user_id, self.key.contact_id, self.key.platform, 1000)
            .unwrap();
        points.reverse();
        points
    }
}

#[tokio::test]
async fn cold_start_emits_calibrating_points() {
    let adapter = ScriptedAdapter::new(vec![Some(10), Some(10), Some(10)]);
    let harness = Harness::start(adapter, false).await;

    sleep(Duration::from_millis(320)).await;
    harness.stop().await;

    let points = harness.points_chronological();
    assert!(points.len() >= 3);
    for p in &points[..3] {
        assert_eq!(p.state, DeviceState::Calibrating);
        assert_eq!(p.median_ms, 0.0);
        assert_eq!(p.threshold_ms, 0.0);
        assert!(p.rtt_ms < 80.0);
        assert_eq!(p.timeout_streak, Some(0));
    }
}

#[tokio::test]
async fn silence_escalates_timeout_then_offline() {
    let adapter = ScriptedAdapter::new(vec![None, None, None]);
    let harness = Harness::start(adapter, false).await;

    sleep(Duration::from_millis(450)).await;
    harness.stop().await;

    let points = harness.points_chronological();
    assert!(points.len() >= 2);
    assert_eq!(points[0].state, DeviceState::Timeout);
    assert_eq!(points[0].timeout_streak, Some(1));
    assert_eq!(points[0].rtt_ms, 80.0);
    assert_eq!(points[1].state, DeviceState::Offline);
    assert_eq!(points[1].timeout_streak, Some(2));
}

#[tokio::test]
async fn recovery_fires_exactly_one_notification() {
    // 10 answered probes build the baseline, two silent ones take the
    // device to OFFLINE, the next answer brings it back.
    let mut plan = vec![Some(10u64); 10];
    plan.push(None);
    plan.push(None);
    plan.push(Some(10));
    let adapter = ScriptedAdapter::new(plan);
    let harness = Harness::start(adapter, true).await;

    sleep(Duration::from_millis(1800)).await;
    harness.stop().await;

    let points = harness.points_chronological();
    assert!(points.len() >= 13, "expected full plan to play out, got {}", points.len());

    let offline_idx = points
        .iter()
        .position(|p| p.state == DeviceState::Offline)
        .expect("device should have gone offline");
    let recovery = &points[offline_idx + 1];
    assert!(
        matches!(recovery.state, DeviceState::Online | DeviceState::Standby),
        "expected recovery after offline, got {:?}",
        recovery.state
    );
    assert_eq!(recovery.timeout_streak, Some(0));

    assert_eq!(harness.mails.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_notification_when_disabled() {
    let mut plan = vec![Some(10u64); 10];
    plan.push(None);
    plan.push(None);
    plan.push(Some(10));
    let adapter = ScriptedAdapter::new(plan);
    let harness = Harness::start(adapter, false).await;

    sleep(Duration::from_millis(1800)).await;
    harness.stop().await;

    assert_eq!(harness.mails.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_receives_points_snapshots_and_insights() {
    let adapter = ScriptedAdapter::new(vec![Some(10), Some(10), Some(10)]);
    let harness = Harness::start(adapter, false).await;
    let (_sub, mut rx) = harness.fanout.connect(1);

    sleep(Duration::from_millis(320)).await;
    harness.stop().await;

    let mut saw_point = false;
    let mut saw_snapshot = false;
    let mut saw_insights = false;
    while let Ok(msg) = rx.try_recv() {
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        match v["type"].as_str().unwrap_or("") {
            "tracker:point" => {
                saw_point = true;
                assert_eq!(v["contact_id"], 2);
                assert_eq!(v["platform"], "mock");
                assert!(v["point"]["rtt_ms"].as_f64().is_some());
            }
            "tracker:snapshot" => {
                saw_snapshot = true;
                assert_eq!(v["snapshot"]["device_count"], 1);
            }
            "insights:update" => {
                saw_insights = true;
                assert!(v["insights"]["total"].as_u64().unwrap() >= 1);
            }
            _ => {}
        }
    }
    assert!(saw_point && saw_snapshot && saw_insights);
}

#[tokio::test]
async fn probes_are_persisted_in_the_index() {
    let adapter = ScriptedAdapter::new(vec![Some(10), Some(10)]);
    let harness = Harness::start(adapter, false).await;

    sleep(Duration::from_millis(250)).await;
    harness.stop().await;

    let points = harness.points_chronological();
    assert!(!points.is_empty());
    // Every emitted point references a probe that reached the store.
    for p in &points {
        assert!(p.probe_id.is_some());
    }
}

#[tokio::test]
async fn supervisor_restart_replaces_session() {
    let adapter = ScriptedAdapter::new(vec![Some(10); 50]);
    let harness = Harness::start(adapter, false).await;
    assert!(harness.supervisor.is_running(harness.key));

    let adapter2 = ScriptedAdapter::new(vec![Some(10); 50]);
    let cfg = Harness::config();
    let runner = SessionRunner::new(
        harness.key,
        adapter2,
        Arc::new(Correlator::new(Classifier::from_config(&cfg), cfg.late_window_ms)),
        harness.store.clone() as Arc<dyn ProbeStore>,
        harness.fanout.clone(),
        Arc::new(InsightsAggregator::new(cfg.window_size, cfg.broadcast_interval_ms)),
        Arc::new(NotifyEdgeDetector::new(Arc::new(CountingMailer(AtomicUsize::new(0))))),
        None,
        cfg,
    );
    harness
        .supervisor
        .start(harness.key, move |stop_rx| runner.run(stop_rx))
        .await;
    assert!(harness.supervisor.is_running(harness.key));

    harness.stop().await;
    assert!(!harness.supervisor.is_running(harness.key));
}
