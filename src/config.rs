//! Process configuration
//!
//! Everything is env-driven with defaults that match the tracker core:
//! probe cadence, classifier constants, window sizes, queue bounds and the
//! per-platform transport settings.

use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Probe cadence and classifier constants.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Per-probe timeout before a TIMEOUT verdict is emitted.
    pub timeout_ms: i64,
    /// Base send interval.
    pub base_interval_s: f64,
    /// Uniform jitter added on top of every interval.
    pub jitter_s: f64,
    /// Interval after exactly one missed probe.
    pub streak_backoff_1_s: f64,
    /// Interval once the device is considered offline (streak >= 2).
    pub streak_backoff_s: f64,
    pub history_limit: usize,
    pub recent_limit: usize,
    pub min_history: usize,
    pub threshold_factor: f64,
    pub threshold_floor_ms: f64,
    pub window_size: usize,
    pub broadcast_interval_ms: i64,
    /// How long a timed-out probe can still be resolved by a late receipt.
    pub late_window_ms: i64,
    pub queue_cap: usize,
    pub backoff_max_s: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            base_interval_s: 2.0,
            jitter_s: 0.15,
            streak_backoff_1_s: 3.0,
            streak_backoff_s: 5.0,
            history_limit: 2000,
            recent_limit: 3,
            min_history: 10,
            threshold_factor: 1.25,
            threshold_floor_ms: 80.0,
            window_size: 600,
            broadcast_interval_ms: 2000,
            late_window_ms: 120_000,
            queue_cap: 10_000,
            backoff_max_s: 30.0,
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout_ms: env_parse("TIMEOUT_MS", d.timeout_ms),
            base_interval_s: env_parse("BASE_INTERVAL_S", d.base_interval_s),
            jitter_s: env_parse("JITTER_S", d.jitter_s),
            streak_backoff_1_s: env_parse("STREAK_BACKOFF_1_S", d.streak_backoff_1_s),
            streak_backoff_s: env_parse("STREAK_BACKOFF_S", d.streak_backoff_s),
            history_limit: env_parse("HISTORY_LIMIT", d.history_limit),
            recent_limit: env_parse("RECENT_LIMIT", d.recent_limit),
            min_history: env_parse("MIN_HISTORY", d.min_history),
            threshold_factor: env_parse("THRESHOLD_FACTOR", d.threshold_factor),
            threshold_floor_ms: env_parse("THRESHOLD_FLOOR_MS", d.threshold_floor_ms),
            window_size: env_parse("WINDOW_SIZE", d.window_size),
            broadcast_interval_ms: env_parse("BROADCAST_INTERVAL_MS", d.broadcast_interval_ms),
            late_window_ms: env_parse("LATE_WINDOW_MS", d.late_window_ms),
            queue_cap: env_parse("QUEUE_CAP", d.queue_cap),
            backoff_max_s: env_parse("BACKOFF_MAX_S", d.backoff_max_s),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_max_s)
    }

    /// Send interval for the current timeout streak, before jitter.
    pub fn interval_for_streak(&self, streak: u32) -> f64 {
        match streak {
            0 => self.base_interval_s,
            1 => self.streak_backoff_1_s,
            _ => self.streak_backoff_s,
        }
    }
}

/// signal-cli-rest-api transport settings.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub enabled: bool,
    pub rest_base: String,
    pub account: Option<String>,
}

impl SignalConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("SIGNAL_ENABLED", false),
            rest_base: env_parse("SIGNAL_REST_BASE", "http://localhost:8080".to_string()),
            account: env_opt("SIGNAL_ACCOUNT"),
        }
    }

    /// Receive endpoint, websocket flavour.
    pub fn ws_url(&self, account: &str) -> String {
        let base = self.rest_base.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/v1/receive/{account}")
    }
}

/// WhatsApp Cloud API (Graph) settings.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub graph_base: String,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
}

impl WhatsAppConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("WHATSAPP_ENABLED", false),
            graph_base: env_parse(
                "WHATSAPP_GRAPH_BASE",
                "https://graph.facebook.com/v21.0".to_string(),
            ),
            phone_number_id: env_opt("WHATSAPP_PHONE_NUMBER_ID"),
            access_token: env_opt("WHATSAPP_ACCESS_TOKEN"),
            verify_token: env_opt("WHATSAPP_VERIFY_TOKEN"),
            app_secret: env_opt("WHATSAPP_APP_SECRET"),
        }
    }
}

/// Unofficial WhatsApp Web bridge settings.
#[derive(Debug, Clone)]
pub struct WhatsAppWebConfig {
    pub enabled: bool,
    pub bridge_base: String,
    pub bridge_ws: String,
}

impl WhatsAppWebConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("WHATSAPP_WEB_ENABLED", false),
            bridge_base: env_parse("WHATSAPP_WEB_BRIDGE_BASE", "http://localhost:8099".to_string()),
            bridge_ws: env_parse("WHATSAPP_WEB_BRIDGE_WS", "ws://localhost:8099/events".to_string()),
        }
    }
}

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: String,
    pub tracker: TrackerConfig,
    pub signal: SignalConfig,
    pub whatsapp: WhatsAppConfig,
    pub whatsapp_web: WhatsAppWebConfig,
    pub mock_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_parse("BIND_ADDR", "0.0.0.0:8000".to_string()),
            database_path: env_parse("DATABASE_PATH", "./pingbot.db".to_string()),
            tracker: TrackerConfig::from_env(),
            signal: SignalConfig::from_env(),
            whatsapp: WhatsAppConfig::from_env(),
            whatsapp_web: WhatsAppWebConfig::from_env(),
            mock_enabled: env_flag("MOCK_ENABLED", true),
        }
    }
}
