//! Device-state classification
//!
//! Pure function of the session's RTT history:
//! - baseline = median(global_history)
//! - threshold = max(baseline * factor, baseline + floor)  (guard for tiny baselines)
//! - ONLINE if the recent moving average is positive and <= threshold, else STANDBY
//! - CALIBRATING until the history holds at least `min_history` samples

use crate::config::TrackerConfig;
use crate::models::DeviceState;

/// Arithmetic mean of the recent window; 0 when empty.
pub fn moving_avg(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median over an unsorted slice; 0 when empty.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    pub history_limit: usize,
    pub recent_limit: usize,
    pub min_history: usize,
    pub threshold_factor: f64,
    pub threshold_floor_ms: f64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            history_limit: 2000,
            recent_limit: 3,
            min_history: 10,
            threshold_factor: 1.25,
            threshold_floor_ms: 80.0,
        }
    }
}

impl Classifier {
    pub fn from_config(cfg: &TrackerConfig) -> Self {
        Self {
            history_limit: cfg.history_limit,
            recent_limit: cfg.recent_limit,
            min_history: cfg.min_history,
            threshold_factor: cfg.threshold_factor,
            threshold_floor_ms: cfg.threshold_floor_ms,
        }
    }

    /// (baseline, threshold); both zero while calibrating.
    pub fn compute_threshold(&self, global_history: &[f64]) -> (f64, f64) {
        if global_history.len() < self.min_history {
            return (0.0, 0.0);
        }
        let b = median(global_history);
        let thr = (b * self.threshold_factor).max(b + self.threshold_floor_ms);
        (b, thr)
    }

    /// Classify one device. `is_offline` short-circuits to OFFLINE while
    /// still reporting whatever baseline the history supports.
    pub fn classify(
        &self,
        global_history: &[f64],
        recent: &[f64],
        is_offline: bool,
    ) -> (DeviceState, f64, f64) {
        if is_offline {
            let (b, thr) = self.compute_threshold(global_history);
            return (DeviceState::Offline, b, thr);
        }

        if global_history.len() < self.min_history {
            return (DeviceState::Calibrating, 0.0, 0.0);
        }

        let (b, thr) = self.compute_threshold(global_history);
        let avg = moving_avg(recent);
        // Tie at the threshold still counts as responsive.
        let state = if avg > 0.0 && avg <= thr {
            DeviceState::Online
        } else {
            DeviceState::Standby
        };
        (state, b, thr)
    }
}
