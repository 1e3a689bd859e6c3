//! Session insights
//!
//! Rolling window over emitted points, summarized at most once per
//! broadcast interval per session.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::models::{now_ms, DeviceState, SessionInsights, SessionKey};

fn percentile(sorted_vals: &[f64], q: f64) -> f64 {
    if sorted_vals.is_empty() {
        return 0.0;
    }
    let q = q.clamp(0.0, 1.0);
    let idx = (q * (sorted_vals.len() - 1) as f64) as usize;
    sorted_vals[idx]
}

struct SessionWindow {
    points: VecDeque<(DeviceState, f64)>,
    last_broadcast_ms: i64,
}

pub struct InsightsAggregator {
    window_size: usize,
    broadcast_interval_ms: i64,
    sessions: Mutex<HashMap<SessionKey, SessionWindow>>,
}

impl InsightsAggregator {
    pub fn new(window_size: usize, broadcast_interval_ms: i64) -> Self {
        Self {
            window_size,
            broadcast_interval_ms,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one point; returns a summary when the rate limit allows.
    pub fn observe_point(&self, key: SessionKey, state: DeviceState, rtt_ms: f64) -> Option<SessionInsights> {
        self.observe_at(key, state, rtt_ms, now_ms())
    }

    pub(crate) fn observe_at(
        &self,
        key: SessionKey,
        state: DeviceState,
        rtt_ms: f64,
        now: i64,
    ) -> Option<SessionInsights> {
        let mut sessions = self.sessions.lock();
        let sess = sessions.entry(key).or_insert_with(|| SessionWindow {
            points: VecDeque::with_capacity(self.window_size),
            last_broadcast_ms: 0,
        });

        if sess.points.len() == self.window_size {
            sess.points.pop_front();
        }
        sess.points.push_back((state, rtt_ms.max(0.0)));

        if now - sess.last_broadcast_ms < self.broadcast_interval_ms {
            return None;
        }
        sess.last_broadcast_ms = now;

        Some(compute(&sess.points, now))
    }

    /// Forget a stopped session's window.
    pub fn drop_session(&self, key: SessionKey) {
        self.sessions.lock().remove(&key);
    }
}

fn compute(points: &VecDeque<(DeviceState, f64)>, computed_at_ms: i64) -> SessionInsights {
    let total = points.len();
    if total == 0 {
        return SessionInsights {
            total: 0,
            online_ratio: 0.0,
            timeout_rate: 0.0,
            median_rtt_ms: 0.0,
            jitter_ms: 0.0,
            streak_max: 0,
            computed_at_ms,
        };
    }

    let mut online = 0usize;
    let mut timeoutish = 0usize;
    let mut rtts: Vec<f64> = Vec::with_capacity(total);
    let mut streak = 0u32;
    let mut streak_max = 0u32;

    for (state, rtt) in points {
        if *state == DeviceState::Online {
            online += 1;
        }
        if state.is_timeoutish() {
            timeoutish += 1;
            streak += 1;
            streak_max = streak_max.max(streak);
        } else {
            streak = 0;
        }

        if *rtt > 0.0 {
            rtts.push(*rtt);
        }
    }

    rtts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p50 = percentile(&rtts, 0.50);
    let p95 = percentile(&rtts, 0.95);

    SessionInsights {
        total,
        online_ratio: online as f64 / total as f64,
        timeout_rate: timeoutish as f64 / total as f64,
        median_rtt_ms: p50,
        jitter_ms: (p95 - p50).max(0.0),
        streak_max,
        computed_at_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    fn key() -> SessionKey {
        SessionKey::new(1, 2, Platform::Mock)
    }

    #[test]
    fn summary_metrics() {
        let agg = InsightsAggregator::new(600, 0);
        agg.observe_at(key(), DeviceState::Online, 100.0, 1);
        agg.observe_at(key(), DeviceState::Online, 200.0, 2);
        agg.observe_at(key(), DeviceState::Timeout, 10_000.0, 3);
        let s = agg.observe_at(key(), DeviceState::Standby, 300.0, 4).unwrap();

        assert_eq!(s.total, 4);
        assert_eq!(s.online_ratio, 0.5);
        assert_eq!(s.timeout_rate, 0.25);
        assert_eq!(s.streak_max, 1);
        assert!(s.median_rtt_ms > 0.0);
        assert!(s.jitter_ms >= 0.0);
    }

    #[test]
    fn rate_limited_emission() {
        let agg = InsightsAggregator::new(600, 2000);
        assert!(agg.observe_at(key(), DeviceState::Online, 50.0, 10_000).is_some());
        assert!(agg.observe_at(key(), DeviceState::Online, 50.0, 11_000).is_none());
        assert!(agg.observe_at(key(), DeviceState::Online, 50.0, 11_999).is_none());
        assert!(agg.observe_at(key(), DeviceState::Online, 50.0, 12_000).is_some());
    }

    #[test]
    fn streak_tracks_longest_run() {
        let agg = InsightsAggregator::new(600, 0);
        for (i, st) in [
            DeviceState::Timeout,
            DeviceState::Offline,
            DeviceState::Offline,
            DeviceState::Online,
            DeviceState::Timeout,
        ]
        .iter()
        .enumerate()
        {
            agg.observe_at(key(), *st, 0.0, i as i64 + 1);
        }
        let s = agg.observe_at(key(), DeviceState::Online, 10.0, 100).unwrap();
        assert_eq!(s.streak_max, 3);
    }

    #[test]
    fn window_is_bounded() {
        let agg = InsightsAggregator::new(3, 0);
        for i in 0..10 {
            agg.observe_at(key(), DeviceState::Online, 10.0, i);
        }
        let s = agg.observe_at(key(), DeviceState::Standby, 10.0, 100).unwrap();
        assert_eq!(s.total, 3);
    }

    #[test]
    fn jitter_ignores_zero_rtt_points() {
        let agg = InsightsAggregator::new(600, 0);
        agg.observe_at(key(), DeviceState::Online, 0.0, 1);
        let s = agg.observe_at(key(), DeviceState::Online, 100.0, 2).unwrap();
        assert_eq!(s.median_rtt_ms, 100.0);
        assert_eq!(s.jitter_ms, 0.0);
    }
}
