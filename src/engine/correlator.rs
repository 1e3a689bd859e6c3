//! Probe/receipt correlation
//!
//! Per-session state behind a short-lived lock: pending probes, per-device
//! RTT windows, the global history and the timeout-streak book-keeping.
//! A probe is resolved by at most one receipt OR one timeout; a timed-out
//! probe lingers in a late bucket so a straggling receipt inside the late
//! window can still produce a measurement.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::engine::classifier::{moving_avg, Classifier};
use crate::models::{now_ms, DeviceState, DeviceView, SessionKey};

#[derive(Debug, Default)]
struct DeviceMetrics {
    last_rtt: f64,
    recent: Vec<f64>,
    updated_at_ms: i64,
    timeout_streak: u32,
    offline: bool,
}

#[derive(Debug, Default)]
struct SessionMetrics {
    global_history: Vec<f64>,
    devices: HashMap<String, DeviceMetrics>,
}

#[derive(Debug, Clone)]
struct LateProbe {
    sent_at_ms: i64,
    timed_out_at_ms: i64,
}

#[derive(Default)]
struct CorrelatorState {
    sessions: HashMap<SessionKey, SessionMetrics>,
    /// (session, probe_id) -> sent_at_ms
    pending: HashMap<(SessionKey, String), i64>,
    /// Timed-out probes that may still be resolved by a late receipt.
    late: HashMap<(SessionKey, String), LateProbe>,
}

/// Result of resolving a probe via receipt.
#[derive(Debug, Clone)]
pub struct ReceiptUpdate {
    pub rtt_ms: f64,
    pub avg_ms: f64,
    pub state: DeviceState,
    pub median_ms: f64,
    pub threshold_ms: f64,
    pub timeout_streak: u32,
    pub updated_at_ms: i64,
}

/// Result of resolving a probe via timeout.
#[derive(Debug, Clone)]
pub struct TimeoutUpdate {
    pub state: DeviceState,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub threshold_ms: f64,
    pub timeout_streak: u32,
}

pub struct Correlator {
    classifier: Classifier,
    late_window_ms: i64,
    inner: Mutex<CorrelatorState>,
}

impl Correlator {
    pub fn new(classifier: Classifier, late_window_ms: i64) -> Self {
        Self {
            classifier,
            late_window_ms,
            inner: Mutex::new(CorrelatorState::default()),
        }
    }

    pub fn mark_probe_sent(&self, key: SessionKey, probe_id: &str, sent_at_ms: i64) {
        let mut st = self.inner.lock();
        st.pending.insert((key, probe_id.to_string()), sent_at_ms);
    }

    pub fn is_probe_pending(&self, key: SessionKey, probe_id: &str) -> bool {
        let st = self.inner.lock();
        st.pending.contains_key(&(key, probe_id.to_string()))
    }

    /// Apply a receipt. Returns `None` for unknown probes (already resolved,
    /// never sent, or past the late window) — the silent dedup path.
    pub fn apply_receipt(
        &self,
        key: SessionKey,
        probe_id: &str,
        device_id: &str,
        received_at_ms: i64,
    ) -> Option<ReceiptUpdate> {
        let mut st = self.inner.lock();

        let map_key = (key, probe_id.to_string());
        let sent_at = match st.pending.remove(&map_key) {
            Some(sent) => sent,
            None => {
                // Late-bucket fallback: a probe that already timed out can
                // still be resolved within the late window.
                self.prune_late(&mut st, now_ms());
                st.late.remove(&map_key).map(|l| l.sent_at_ms)?
            }
        };

        let rtt = (received_at_ms - sent_at).max(0) as f64;

        let sess = st.sessions.entry(key).or_default();
        let dm = sess.devices.entry(device_id.to_string()).or_default();

        dm.offline = false;
        dm.timeout_streak = 0;
        dm.last_rtt = rtt;
        dm.updated_at_ms = received_at_ms;

        dm.recent.push(rtt);
        if dm.recent.len() > self.classifier.recent_limit {
            let excess = dm.recent.len() - self.classifier.recent_limit;
            dm.recent.drain(..excess);
        }

        sess.global_history.push(rtt);
        if sess.global_history.len() > self.classifier.history_limit {
            let excess = sess.global_history.len() - self.classifier.history_limit;
            sess.global_history.drain(..excess);
        }

        let (state, med, thr) =
            self.classifier.classify(&sess.global_history, &sess.devices[device_id].recent, false);
        let avg = moving_avg(&sess.devices[device_id].recent);

        Some(ReceiptUpdate {
            rtt_ms: rtt,
            avg_ms: avg,
            state,
            median_ms: med,
            threshold_ms: thr,
            timeout_streak: 0,
            updated_at_ms: received_at_ms,
        })
    }

    /// Resolve a probe as timed out. Returns `None` if the probe is no
    /// longer pending (a receipt beat the timeout task).
    pub fn mark_timeout(
        &self,
        key: SessionKey,
        probe_id: &str,
        device_id: &str,
        timeout_ms: i64,
    ) -> Option<TimeoutUpdate> {
        let now = now_ms();
        let mut st = self.inner.lock();

        let map_key = (key, probe_id.to_string());
        let sent_at = st.pending.remove(&map_key)?;

        self.prune_late(&mut st, now);
        st.late.insert(map_key, LateProbe { sent_at_ms: sent_at, timed_out_at_ms: now });

        let sess = st.sessions.entry(key).or_default();
        let dm = sess.devices.entry(device_id.to_string()).or_default();

        dm.last_rtt = timeout_ms as f64;
        dm.updated_at_ms = now;
        dm.timeout_streak += 1;
        dm.offline = dm.timeout_streak >= 2;

        let state = if dm.offline { DeviceState::Offline } else { DeviceState::Timeout };
        let streak = dm.timeout_streak;
        let avg = moving_avg(&dm.recent);
        let (med, thr) = self.classifier.compute_threshold(&sess.global_history);

        Some(TimeoutUpdate {
            state,
            avg_ms: avg,
            median_ms: med,
            threshold_ms: thr,
            timeout_streak: streak,
        })
    }

    /// Classifier output per device, patched to TIMEOUT/OFFLINE where the
    /// streak book-keeping says so.
    pub fn snapshot_devices(&self, key: SessionKey) -> Vec<DeviceView> {
        let st = self.inner.lock();
        let Some(sess) = st.sessions.get(&key) else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(sess.devices.len());
        for (device_id, dm) in &sess.devices {
            let (state, _, _) =
                self.classifier.classify(&sess.global_history, &dm.recent, dm.offline);
            let state = if !dm.offline && dm.timeout_streak > 0 {
                DeviceState::Timeout
            } else {
                state
            };
            out.push(DeviceView {
                device_id: device_id.clone(),
                state,
                rtt_ms: dm.last_rtt,
                avg_ms: moving_avg(&dm.recent),
                updated_at_ms: dm.updated_at_ms,
                timeout_streak: dm.timeout_streak,
            });
        }
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// (baseline, threshold) for the session's global history.
    pub fn global_stats(&self, key: SessionKey) -> (f64, f64) {
        let st = self.inner.lock();
        match st.sessions.get(&key) {
            Some(sess) => self.classifier.compute_threshold(&sess.global_history),
            None => (0.0, 0.0),
        }
    }

    /// Current timeout streak of one device; drives the send-loop backoff.
    pub fn timeout_streak(&self, key: SessionKey, device_id: &str) -> u32 {
        let st = self.inner.lock();
        st.sessions
            .get(&key)
            .and_then(|s| s.devices.get(device_id))
            .map(|d| d.timeout_streak)
            .unwrap_or(0)
    }

    /// Drop all in-memory state for a stopped session.
    pub fn drop_session(&self, key: SessionKey) {
        let mut st = self.inner.lock();
        st.sessions.remove(&key);
        st.pending.retain(|(k, _), _| *k != key);
        st.late.retain(|(k, _), _| *k != key);
    }

    fn prune_late(&self, st: &mut CorrelatorState, now: i64) {
        let window = self.late_window_ms;
        st.late.retain(|_, l| now - l.timed_out_at_ms <= window);
    }

    #[cfg(test)]
    fn seed_history(&self, key: SessionKey, samples: &[f64]) {
        let mut st = self.inner.lock();
        let sess = st.sessions.entry(key).or_default();
        sess.global_history.extend_from_slice(samples);
    }
}
