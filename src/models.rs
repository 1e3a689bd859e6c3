//! Shared domain types: platforms, session keys, device states, tracker
//! points and the realtime event envelope.

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ContactId = i64;

/// Millisecond wall-clock from the single authoritative process.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Messaging platforms with a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Signal,
    Whatsapp,
    WhatsappWeb,
    Mock,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Signal => "signal",
            Platform::Whatsapp => "whatsapp",
            Platform::WhatsappWeb => "whatsapp_web",
            Platform::Mock => "mock",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "signal" => Some(Platform::Signal),
            "whatsapp" => Some(Platform::Whatsapp),
            "whatsapp_web" => Some(Platform::WhatsappWeb),
            "mock" => Some(Platform::Mock),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The isolation unit of all in-memory metrics. A contact's Signal RTT
/// distribution must not pollute the same contact's WhatsApp baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: UserId,
    pub contact_id: ContactId,
    pub platform: Platform,
}

impl SessionKey {
    pub fn new(user_id: UserId, contact_id: ContactId, platform: Platform) -> Self {
        Self { user_id, contact_id, platform }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.contact_id, self.platform)
    }
}

/// Classified device state for one device within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Calibrating,
    Online,
    Standby,
    Timeout,
    Offline,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Calibrating => "CALIBRATING",
            DeviceState::Online => "ONLINE",
            DeviceState::Standby => "STANDBY",
            DeviceState::Timeout => "TIMEOUT",
            DeviceState::Offline => "OFFLINE",
        }
    }

    pub fn parse(s: &str) -> Option<DeviceState> {
        match s {
            "CALIBRATING" => Some(DeviceState::Calibrating),
            "ONLINE" => Some(DeviceState::Online),
            "STANDBY" => Some(DeviceState::Standby),
            "TIMEOUT" => Some(DeviceState::Timeout),
            "OFFLINE" => Some(DeviceState::Offline),
            _ => None,
        }
    }

    /// TIMEOUT and OFFLINE both mean "the probe went unanswered".
    pub fn is_timeoutish(&self) -> bool {
        matches!(self, DeviceState::Timeout | DeviceState::Offline)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The default device id. Only Signal populates anything else.
pub const PRIMARY_DEVICE: &str = "primary";

/// One emitted measurement; immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerPoint {
    pub timestamp_ms: i64,
    pub device_id: String,
    pub state: DeviceState,
    pub rtt_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub threshold_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_streak: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_id: Option<String>,
}

/// Per-device view reported in `tracker:snapshot` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: String,
    pub state: DeviceState,
    pub rtt_ms: f64,
    pub avg_ms: f64,
    pub updated_at_ms: i64,
    pub timeout_streak: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub devices: Vec<DeviceView>,
    pub device_count: usize,
    pub median_ms: f64,
    pub threshold_ms: f64,
}

/// Session summary emitted by the insights aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInsights {
    pub total: usize,
    pub online_ratio: f64,
    pub timeout_rate: f64,
    pub median_rtt_ms: f64,
    pub jitter_ms: f64,
    pub streak_max: u32,
    pub computed_at_ms: i64,
}

/// Contact row surfaced in `contacts:init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactInfo {
    pub id: ContactId,
    pub platform: Platform,
    pub target: String,
    pub display_name: String,
    pub notify_online: bool,
}

/// Realtime event envelope fanned out to stream subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "contacts:init")]
    ContactsInit { contacts: Vec<ContactInfo> },
    #[serde(rename = "tracker:point")]
    TrackerPoint {
        contact_id: ContactId,
        platform: Platform,
        point: TrackerPoint,
    },
    #[serde(rename = "tracker:snapshot")]
    TrackerSnapshot {
        contact_id: ContactId,
        platform: Platform,
        snapshot: DeviceSnapshot,
    },
    #[serde(rename = "insights:update")]
    InsightsUpdate {
        contact_id: ContactId,
        platform: Platform,
        insights: SessionInsights,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_roundtrip() {
        for p in [Platform::Signal, Platform::Whatsapp, Platform::WhatsappWeb, Platform::Mock] {
            assert_eq!(Platform::parse(p.as_str()), Some(p));
        }
        assert_eq!(Platform::parse("telegram"), None);
    }

    #[test]
    fn state_serializes_screaming() {
        let json = serde_json::to_string(&DeviceState::Calibrating).unwrap();
        assert_eq!(json, "\"CALIBRATING\"");
        assert_eq!(DeviceState::parse("OFFLINE"), Some(DeviceState::Offline));
    }

    #[test]
    fn event_envelope_shape() {
        let ev = StreamEvent::TrackerPoint {
            contact_id: 7,
            platform: Platform::Mock,
            point: TrackerPoint {
                timestamp_ms: 1,
                device_id: PRIMARY_DEVICE.into(),
                state: DeviceState::Online,
                rtt_ms: 50.0,
                avg_ms: 50.0,
                median_ms: 40.0,
                threshold_ms: 120.0,
                timeout_streak: Some(0),
                probe_id: None,
            },
        };
        let v: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tracker:point");
        assert_eq!(v["platform"], "mock");
        assert_eq!(v["point"]["state"], "ONLINE");
        assert!(v["point"].get("probe_id").is_none());
    }
}
