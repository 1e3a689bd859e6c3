//! Session runner
//!
//! One per active (user, contact, platform): a send loop probing on an
//! adaptive interval, a receipt loop consuming the adapter's stream, and a
//! short-lived timeout task per outstanding probe. Every resolution emits
//! a tracker point through the same pipeline: persist, fan out, feed the
//! insights aggregator, feed the notify edge detector.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::adapters::{Adapter, AdapterReceipt};
use crate::config::TrackerConfig;
use crate::engine::correlator::Correlator;
use crate::engine::insights::InsightsAggregator;
use crate::models::{now_ms, DeviceState, SessionKey, StreamEvent, TrackerPoint, PRIMARY_DEVICE};
use crate::models::DeviceSnapshot;
use crate::notify::{NotifyContext, NotifyEdgeDetector};
use crate::realtime::RealtimeFanout;
use crate::storage::{ProbeRecord, ProbeStore};

pub struct SessionRunner {
    key: SessionKey,
    adapter: Arc<dyn Adapter>,
    correlator: Arc<Correlator>,
    store: Arc<dyn ProbeStore>,
    fanout: Arc<RealtimeFanout>,
    insights: Arc<InsightsAggregator>,
    notifier: Arc<NotifyEdgeDetector>,
    notify_ctx: Option<NotifyContext>,
    cfg: TrackerConfig,
    timeout_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SessionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: SessionKey,
        adapter: Arc<dyn Adapter>,
        correlator: Arc<Correlator>,
        store: Arc<dyn ProbeStore>,
        fanout: Arc<RealtimeFanout>,
        insights: Arc<InsightsAggregator>,
        notifier: Arc<NotifyEdgeDetector>,
        notify_ctx: Option<NotifyContext>,
        cfg: TrackerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            adapter,
            correlator,
            store,
            fanout,
            insights,
            notifier,
            notify_ctx,
            cfg,
            timeout_tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Drive the session until the stop signal fires (or its sender is
    /// dropped, which counts the same).
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let receipts = match self.adapter.receipts().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("receipt stream unavailable session={}: {}", self.key, e);
                self.adapter.close().await;
                return;
            }
        };
        let receipt_task = tokio::spawn(Arc::clone(&self).receipt_loop(receipts));

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let sent = tokio::select! {
                _ = stop_rx.changed() => break,
                res = self.adapter.send_probe() => res,
            };

            match sent {
                Ok(probe) => {
                    let record = ProbeRecord {
                        user_id: self.key.user_id,
                        contact_id: self.key.contact_id,
                        platform: self.key.platform,
                        probe_id: probe.probe_id.clone(),
                        sent_at_ms: probe.sent_at_ms,
                        platform_message_ts: probe.platform_message_ts,
                        platform_message_id: probe.platform_message_id.clone(),
                        send_response: probe.send_response.clone(),
                    };
                    if let Err(e) = self.store.insert_probe(&record) {
                        warn!("probe persist failed session={}: {}", self.key, e);
                    }
                    self.correlator.mark_probe_sent(self.key, &probe.probe_id, probe.sent_at_ms);
                    self.arm_timeout(probe.probe_id);
                }
                Err(e) => {
                    // A missed send is not a timeout: no pending probe was
                    // created, the loop just tries again next interval.
                    warn!("probe send failed session={}: {}", self.key, e);
                }
            }

            let streak = self.correlator.timeout_streak(self.key, PRIMARY_DEVICE);
            let base = self.cfg.interval_for_streak(streak);
            let jitter = rand::thread_rng().gen::<f64>() * self.cfg.jitter_s;
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = sleep(Duration::from_secs_f64(base + jitter)) => {}
            }
        }

        // Teardown order: receipt loop first, then every outstanding
        // timeout task, then the adapter's resources.
        receipt_task.abort();
        let _ = receipt_task.await;

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.timeout_tasks.lock();
            tasks.drain().map(|(_, h)| h).collect()
        };
        for h in &handles {
            h.abort();
        }
        for h in handles {
            let _ = h.await;
        }

        self.adapter.close().await;
        debug!("session runner exited session={}", self.key);
    }

    fn arm_timeout(self: &Arc<Self>, probe_id: String) {
        let runner = Arc::clone(self);
        let task_key = probe_id.clone();
        let handle = tokio::spawn(async move {
            sleep(runner.cfg.timeout()).await;
            runner.resolve_timeout(&probe_id);
            runner.timeout_tasks.lock().remove(&probe_id);
        });
        self.timeout_tasks.lock().insert(task_key, handle);
    }

    fn resolve_timeout(&self, probe_id: &str) {
        if !self.correlator.is_probe_pending(self.key, probe_id) {
            return;
        }
        let Some(update) =
            self.correlator.mark_timeout(self.key, probe_id, PRIMARY_DEVICE, self.cfg.timeout_ms)
        else {
            // A receipt slipped in between the check and the resolution.
            return;
        };

        self.emit_point(
            PRIMARY_DEVICE,
            update.state,
            self.cfg.timeout_ms as f64,
            update.avg_ms,
            update.median_ms,
            update.threshold_ms,
            update.timeout_streak,
            Some(probe_id),
        );
        self.broadcast_snapshot();
    }

    async fn receipt_loop(self: Arc<Self>, mut receipts: mpsc::Receiver<AdapterReceipt>) {
        while let Some(r) = receipts.recv().await {
            if let Some(handle) = self.timeout_tasks.lock().remove(&r.probe_id) {
                handle.abort();
            }

            let Some(update) =
                self.correlator.apply_receipt(self.key, &r.probe_id, &r.device_id, r.received_at_ms)
            else {
                continue;
            };

            self.emit_point(
                &r.device_id,
                update.state,
                update.rtt_ms,
                update.avg_ms,
                update.median_ms,
                update.threshold_ms,
                update.timeout_streak,
                Some(r.probe_id.as_str()),
            );
            self.broadcast_snapshot();
        }
    }

    /// The emission pipeline; no suspension points, so the sequence is
    /// atomic with respect to every other task.
    #[allow(clippy::too_many_arguments)]
    fn emit_point(
        &self,
        device_id: &str,
        state: DeviceState,
        rtt_ms: f64,
        avg_ms: f64,
        median_ms: f64,
        threshold_ms: f64,
        timeout_streak: u32,
        probe_id: Option<&str>,
    ) {
        let ts = now_ms();
        let point = TrackerPoint {
            timestamp_ms: ts,
            device_id: device_id.to_string(),
            state,
            rtt_ms,
            avg_ms,
            median_ms,
            threshold_ms,
            timeout_streak: Some(timeout_streak),
            probe_id: probe_id.map(str::to_string),
        };

        if let Err(e) = self.store.add_point(
            self.key.user_id,
            self.key.contact_id,
            self.key.platform,
            &point,
        ) {
            warn!("point persist failed session={}: {}", self.key, e);
        }

        self.fanout.broadcast_to_user(
            self.key.user_id,
            &StreamEvent::TrackerPoint {
                contact_id: self.key.contact_id,
                platform: self.key.platform,
                point: point.clone(),
            },
        );

        if let Some(insights) = self.insights.observe_point(self.key, state, rtt_ms) {
            self.fanout.broadcast_to_user(
                self.key.user_id,
                &StreamEvent::InsightsUpdate {
                    contact_id: self.key.contact_id,
                    platform: self.key.platform,
                    insights,
                },
            );
        }

        if device_id == PRIMARY_DEVICE {
            if let Some(ctx) = &self.notify_ctx {
                self.notifier.observe(
                    ctx,
                    self.key,
                    device_id,
                    state,
                    rtt_ms,
                    avg_ms,
                    median_ms,
                    threshold_ms,
                    timeout_streak,
                    ts,
                );
            }
        }
    }

    fn broadcast_snapshot(&self) {
        let devices = self.correlator.snapshot_devices(self.key);
        let (median_ms, threshold_ms) = self.correlator.global_stats(self.key);
        self.fanout.broadcast_to_user(
            self.key.user_id,
            &StreamEvent::TrackerSnapshot {
                contact_id: self.key.contact_id,
                platform: self.key.platform,
                snapshot: DeviceSnapshot {
                    device_count: devices.len(),
                    devices,
                    median_ms,
                    threshold_ms,
                },
            },
        );
    }
}
