//! State-transition notifications
//!
//! Remembers the last observed state per (session, device) and fires an
//! email when a device comes back from OFFLINE. The memory write is
//! unconditional; the edge check runs against the value captured before
//! the write, which gives at-most-once semantics per edge.

mod mailer;

pub use mailer::{LogMailer, Mailer};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::models::{DeviceState, Platform, SessionKey};

/// Contact context resolved once at session start.
#[derive(Debug, Clone)]
pub struct NotifyContext {
    pub user_email: String,
    pub contact_label: String,
    pub contact_target: String,
    pub platform: Platform,
    pub notify_enabled: bool,
}

/// Payload handed to the mailer on an OFFLINE -> back-online edge.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub user_email: String,
    pub contact_label: String,
    pub contact_target: String,
    pub platform: Platform,
    pub new_state: DeviceState,
    pub rtt_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub threshold_ms: f64,
    pub timeout_streak: u32,
    pub at_ms: i64,
}

fn is_back_online(state: DeviceState) -> bool {
    matches!(state, DeviceState::Online | DeviceState::Standby)
}

pub struct NotifyEdgeDetector {
    mailer: Arc<dyn Mailer>,
    last_state: Mutex<HashMap<(SessionKey, String), DeviceState>>,
}

impl NotifyEdgeDetector {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mailer,
            last_state: Mutex::new(HashMap::new()),
        }
    }

    /// Record an observation; fires iff the previous state was exactly
    /// OFFLINE, the new one is ONLINE/STANDBY and the contact opted in.
    /// Returns the fired event for callers that want to inspect it.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &self,
        ctx: &NotifyContext,
        key: SessionKey,
        device_id: &str,
        new_state: DeviceState,
        rtt_ms: f64,
        avg_ms: f64,
        median_ms: f64,
        threshold_ms: f64,
        timeout_streak: u32,
        at_ms: i64,
    ) -> Option<NotifyEvent> {
        let prev = {
            let mut last = self.last_state.lock();
            last.insert((key, device_id.to_string()), new_state)
        };

        // Track state even when disabled so toggling on behaves predictably.
        if !ctx.notify_enabled {
            return None;
        }
        if prev != Some(DeviceState::Offline) || !is_back_online(new_state) {
            return None;
        }

        let ev = NotifyEvent {
            user_email: ctx.user_email.clone(),
            contact_label: ctx.contact_label.clone(),
            contact_target: ctx.contact_target.clone(),
            platform: ctx.platform,
            new_state,
            rtt_ms,
            avg_ms,
            median_ms,
            threshold_ms,
            timeout_streak,
            at_ms,
        };

        info!(
            "notify edge OFFLINE -> {} contact={} platform={}",
            new_state, ev.contact_label, ev.platform
        );

        let subject = format!("✅ {} is back online ({})", ev.contact_label, ev.new_state);
        let body = format!(
            "Contact: {}\nTarget: {}\nPlatform: {}\nTransition: OFFLINE → {}\nRTT: {} ms\nAvg: {} ms\nMedian: {} ms\nThreshold: {} ms\nTimeout streak: {}\nTime: {}\n",
            ev.contact_label,
            ev.contact_target,
            ev.platform,
            ev.new_state,
            ev.rtt_ms.round(),
            ev.avg_ms.round(),
            ev.median_ms.round(),
            ev.threshold_ms.round(),
            ev.timeout_streak,
            ev.at_ms,
        );
        self.mailer.send(&ev.user_email, &subject, &body);

        Some(ev)
    }

    /// Forget a stopped session's edges.
    pub fn drop_session(&self, key: SessionKey) {
        self.last_state.lock().retain(|(k, _), _| *k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PRIMARY_DEVICE;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMailer(AtomicUsize);

    impl Mailer for CountingMailer {
        fn send(&self, _to: &str, _subject: &str, _body: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ctx(enabled: bool) -> NotifyContext {
        NotifyContext {
            user_email: "me@example.com".into(),
            contact_label: "Marc".into(),
            contact_target: "+491234".into(),
            platform: Platform::Signal,
            notify_enabled: enabled,
        }
    }

    fn key() -> SessionKey {
        SessionKey::new(1, 2, Platform::Signal)
    }

    fn observe(
        d: &NotifyEdgeDetector,
        c: &NotifyContext,
        state: DeviceState,
    ) -> Option<NotifyEvent> {
        d.observe(c, key(), PRIMARY_DEVICE, state, 50.0, 50.0, 100.0, 180.0, 0, 1000)
    }

    #[test]
    fn fires_once_on_offline_to_online() {
        let mailer = Arc::new(CountingMailer(AtomicUsize::new(0)));
        let d = NotifyEdgeDetector::new(mailer.clone());
        let c = ctx(true);

        assert!(observe(&d, &c, DeviceState::Offline).is_none());
        let ev = observe(&d, &c, DeviceState::Online).unwrap();
        assert_eq!(ev.new_state, DeviceState::Online);
        // Edge consumed: staying online fires nothing further.
        assert!(observe(&d, &c, DeviceState::Online).is_none());
        assert_eq!(mailer.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_on_offline_to_standby() {
        let d = NotifyEdgeDetector::new(Arc::new(LogMailer));
        let c = ctx(true);
        observe(&d, &c, DeviceState::Offline);
        assert!(observe(&d, &c, DeviceState::Standby).is_some());
    }

    #[test]
    fn silent_when_previous_state_not_offline() {
        let d = NotifyEdgeDetector::new(Arc::new(LogMailer));
        let c = ctx(true);
        observe(&d, &c, DeviceState::Timeout);
        assert!(observe(&d, &c, DeviceState::Online).is_none());
    }

    #[test]
    fn silent_when_disabled_but_memory_tracks() {
        let mailer = Arc::new(CountingMailer(AtomicUsize::new(0)));
        let d = NotifyEdgeDetector::new(mailer.clone());
        let disabled = ctx(false);

        observe(&d, &disabled, DeviceState::Offline);
        assert!(observe(&d, &disabled, DeviceState::Online).is_none());
        assert_eq!(mailer.0.load(Ordering::SeqCst), 0);

        // Toggle on: the memory followed along, no stale OFFLINE edge left.
        let enabled = ctx(true);
        assert!(observe(&d, &enabled, DeviceState::Online).is_none());
    }

    #[test]
    fn devices_have_independent_edges() {
        let d = NotifyEdgeDetector::new(Arc::new(LogMailer));
        let c = ctx(true);
        d.observe(&c, key(), "primary", DeviceState::Offline, 0.0, 0.0, 0.0, 0.0, 2, 1);
        // A different device coming online is not the primary's edge.
        assert!(d
            .observe(&c, key(), "tablet", DeviceState::Online, 1.0, 1.0, 1.0, 1.0, 0, 2)
            .is_none());
        assert!(d
            .observe(&c, key(), "primary", DeviceState::Online, 1.0, 1.0, 1.0, 1.0, 0, 3)
            .is_some());
    }
}
