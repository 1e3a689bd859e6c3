//! Durable storage: probe index, tracker points, contact directory
//!
//! Single sqlite database in WAL mode behind a parking_lot mutex; every
//! operation is a short prepared statement so holding the lock across the
//! call is cheap.

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use serde_json::Value;

use crate::models::{ContactId, ContactInfo, Platform, TrackerPoint, UserId};

/// A probe row as inserted on send.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub user_id: UserId,
    pub contact_id: ContactId,
    pub platform: Platform,
    pub probe_id: String,
    pub sent_at_ms: i64,
    pub platform_message_ts: Option<i64>,
    pub platform_message_id: Option<String>,
    pub send_response: Option<Value>,
}

/// A probe row as read back while resolving receipts.
#[derive(Debug, Clone)]
pub struct StoredProbe {
    pub user_id: UserId,
    pub contact_id: ContactId,
    pub platform: Platform,
    pub probe_id: String,
    pub sent_at_ms: i64,
    pub platform_message_ts: Option<i64>,
    pub platform_message_id: Option<String>,
    pub delivered_at_ms: Option<i64>,
    pub read_at_ms: Option<i64>,
}

/// The durable probe index contract. Writes are idempotent on
/// (platform, probe_id); delivered/read marks are set-once.
pub trait ProbeStore: Send + Sync {
    fn insert_probe(&self, rec: &ProbeRecord) -> Result<()>;

    /// Look a probe up by any of the candidate message timestamps. The
    /// candidates absorb seconds-vs-milliseconds unit mismatches.
    fn find_by_platform_ts(&self, platform: Platform, candidates: &[i64]) -> Result<Option<StoredProbe>>;

    fn find_by_platform_message_id(&self, platform: Platform, message_id: &str) -> Result<Option<StoredProbe>>;

    /// Returns true when the write landed (column was empty).
    fn mark_delivered(&self, probe_id: &str, delivered_at_ms: i64) -> Result<bool>;

    /// Returns true when the write landed (column was empty).
    fn mark_read(&self, probe_id: &str, read_at_ms: i64) -> Result<bool>;

    fn add_point(&self, user_id: UserId, contact_id: ContactId, platform: Platform, point: &TrackerPoint) -> Result<()>;

    fn recent_points(&self, user_id: UserId, contact_id: ContactId, platform: Platform, limit: usize) -> Result<Vec<TrackerPoint>>;
}

/// A contact row; the minimal slice of the directory the engine needs.
#[derive(Debug, Clone)]
pub struct ContactRow {
    pub id: ContactId,
    pub user_id: UserId,
    pub platform: Platform,
    pub target: String,
    pub display_name: String,
    pub notify_online: bool,
    pub notify_email: Option<String>,
}

impl ContactRow {
    pub fn info(&self) -> ContactInfo {
        ContactInfo {
            id: self.id,
            platform: self.platform,
            target: self.target.clone(),
            display_name: self.display_name.clone(),
            notify_online: self.notify_online,
        }
    }
}
