//! SQLite-backed store
//!
//! WAL mode for concurrent reads during writes, prepared statement caching,
//! covering indexes on the receipt-resolution lookups.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{ContactRow, ProbeRecord, ProbeStore, StoredProbe};
use crate::models::{ContactId, DeviceState, Platform, TrackerPoint, UserId};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    platform TEXT NOT NULL,
    target TEXT NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    notify_online INTEGER NOT NULL DEFAULT 0,
    notify_email TEXT
);

CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);

CREATE TABLE IF NOT EXISTS platform_probes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    contact_id INTEGER NOT NULL,
    platform TEXT NOT NULL,
    probe_id TEXT NOT NULL,
    sent_at_ms INTEGER NOT NULL,
    platform_message_ts INTEGER,
    platform_message_id TEXT,
    delivered_at_ms INTEGER,
    read_at_ms INTEGER,
    send_response TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS ix_platform_probe_unique
    ON platform_probes(platform, probe_id);
CREATE INDEX IF NOT EXISTS ix_platform_probe_ts
    ON platform_probes(platform, platform_message_ts);
CREATE INDEX IF NOT EXISTS ix_platform_probe_msg_id
    ON platform_probes(platform, platform_message_id);

CREATE TABLE IF NOT EXISTS tracker_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    contact_id INTEGER NOT NULL,
    platform TEXT NOT NULL,
    device_id TEXT NOT NULL,
    state TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    rtt_ms REAL NOT NULL,
    avg_ms REAL NOT NULL,
    median_ms REAL NOT NULL,
    threshold_ms REAL NOT NULL,
    timeout_streak INTEGER,
    probe_id TEXT
);

CREATE INDEX IF NOT EXISTS ix_points_session
    ON tracker_points(user_id, contact_id, platform, timestamp_ms DESC);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite at {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        debug!("sqlite store ready at {}", path);
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Private in-memory database, used by tests and the mock platform.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ---- contact directory ----

    pub fn upsert_contact(&self, row: &ContactRow) -> Result<ContactId> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO contacts (id, user_id, platform, target, display_name, notify_online, notify_email)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT(id) DO UPDATE SET
                   platform = excluded.platform,
                   target = excluded.target,
                   display_name = excluded.display_name,
                   notify_online = excluded.notify_online,
                   notify_email = excluded.notify_email"#,
            params![
                row.id,
                row.user_id,
                row.platform.as_str(),
                row.target,
                row.display_name,
                row.notify_online as i64,
                row.notify_email,
            ],
        )?;
        Ok(row.id)
    }

    pub fn get_contact(&self, user_id: UserId, contact_id: ContactId) -> Result<Option<ContactRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, platform, target, display_name, notify_online, notify_email
             FROM contacts WHERE id = ?1 AND user_id = ?2",
        )?;
        let row = stmt
            .query_row(params![contact_id, user_id], |r| {
                Ok(ContactRow {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    platform: parse_platform(&r.get::<_, String>(2)?),
                    target: r.get(3)?,
                    display_name: r.get(4)?,
                    notify_online: r.get::<_, i64>(5)? != 0,
                    notify_email: r.get(6)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn list_contacts(&self, user_id: UserId) -> Result<Vec<ContactRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, platform, target, display_name, notify_online, notify_email
             FROM contacts WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_id], |r| {
                Ok(ContactRow {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    platform: parse_platform(&r.get::<_, String>(2)?),
                    target: r.get(3)?,
                    display_name: r.get(4)?,
                    notify_online: r.get::<_, i64>(5)? != 0,
                    notify_email: r.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_platform(s: &str) -> Platform {
    Platform::parse(s).unwrap_or(Platform::Mock)
}

fn probe_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredProbe> {
    Ok(StoredProbe {
        user_id: r.get(0)?,
        contact_id: r.get(1)?,
        platform: parse_platform(&r.get::<_, String>(2)?),
        probe_id: r.get(3)?,
        sent_at_ms: r.get(4)?,
        platform_message_ts: r.get(5)?,
        platform_message_id: r.get(6)?,
        delivered_at_ms: r.get(7)?,
        read_at_ms: r.get(8)?,
    })
}

const PROBE_COLS: &str = "user_id, contact_id, platform, probe_id, sent_at_ms, \
                          platform_message_ts, platform_message_id, delivered_at_ms, read_at_ms";

impl ProbeStore for SqliteStore {
    fn insert_probe(&self, rec: &ProbeRecord) -> Result<()> {
        let response = rec
            .send_response
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()?;
        let conn = self.conn.lock();
        // Idempotent on (platform, probe_id): a duplicate send attempt for
        // the same probe id keeps the original row.
        conn.execute(
            r#"INSERT OR IGNORE INTO platform_probes
               (user_id, contact_id, platform, probe_id, sent_at_ms,
                platform_message_ts, platform_message_id, send_response)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                rec.user_id,
                rec.contact_id,
                rec.platform.as_str(),
                rec.probe_id,
                rec.sent_at_ms,
                rec.platform_message_ts,
                rec.platform_message_id,
                response,
            ],
        )?;
        Ok(())
    }

    fn find_by_platform_ts(&self, platform: Platform, candidates: &[i64]) -> Result<Option<StoredProbe>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        for ts in candidates {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PROBE_COLS} FROM platform_probes
                 WHERE platform = ?1 AND platform_message_ts = ?2"
            ))?;
            let row = stmt
                .query_row(params![platform.as_str(), ts], probe_from_row)
                .optional()?;
            if row.is_some() {
                return Ok(row);
            }
        }
        Ok(None)
    }

    fn find_by_platform_message_id(&self, platform: Platform, message_id: &str) -> Result<Option<StoredProbe>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PROBE_COLS} FROM platform_probes
             WHERE platform = ?1 AND platform_message_id = ?2"
        ))?;
        let row = stmt
            .query_row(params![platform.as_str(), message_id], probe_from_row)
            .optional()?;
        Ok(row)
    }

    fn mark_delivered(&self, probe_id: &str, delivered_at_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE platform_probes SET delivered_at_ms = ?2
             WHERE probe_id = ?1 AND delivered_at_ms IS NULL",
            params![probe_id, delivered_at_ms],
        )?;
        Ok(changed > 0)
    }

    fn mark_read(&self, probe_id: &str, read_at_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE platform_probes SET read_at_ms = ?2
             WHERE probe_id = ?1 AND read_at_ms IS NULL",
            params![probe_id, read_at_ms],
        )?;
        Ok(changed > 0)
    }

    fn add_point(&self, user_id: UserId, contact_id: ContactId, platform: Platform, point: &TrackerPoint) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO tracker_points
               (user_id, contact_id, platform, device_id, state, timestamp_ms,
                rtt_ms, avg_ms, median_ms, threshold_ms, timeout_streak, probe_id)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
            params![
                user_id,
                contact_id,
                platform.as_str(),
                point.device_id,
                point.state.as_str(),
                point.timestamp_ms,
                point.rtt_ms,
                point.avg_ms,
                point.median_ms,
                point.threshold_ms,
                point.timeout_streak,
                point.probe_id,
            ],
        )?;
        Ok(())
    }

    fn recent_points(&self, user_id: UserId, contact_id: ContactId, platform: Platform, limit: usize) -> Result<Vec<TrackerPoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT device_id, state, timestamp_ms, rtt_ms, avg_ms, median_ms, threshold_ms, timeout_streak, probe_id
             FROM tracker_points
             WHERE user_id = ?1 AND contact_id = ?2 AND platform = ?3
             ORDER BY timestamp_ms DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![user_id, contact_id, platform.as_str(), limit as i64], |r| {
                Ok(TrackerPoint {
                    device_id: r.get(0)?,
                    state: DeviceState::parse(&r.get::<_, String>(1)?).unwrap_or(DeviceState::Calibrating),
                    timestamp_ms: r.get(2)?,
                    rtt_ms: r.get(3)?,
                    avg_ms: r.get(4)?,
                    median_ms: r.get(5)?,
                    threshold_ms: r.get(6)?,
                    timeout_streak: r.get(7)?,
                    probe_id: r.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PRIMARY_DEVICE;

    fn probe(probe_id: &str, ts: Option<i64>, msg_id: Option<&str>) -> ProbeRecord {
        ProbeRecord {
            user_id: 1,
            contact_id: 2,
            platform: Platform::Signal,
            probe_id: probe_id.into(),
            sent_at_ms: 1_700_000_000_000,
            platform_message_ts: ts,
            platform_message_id: msg_id.map(Into::into),
            send_response: None,
        }
    }

    #[test]
    fn insert_is_idempotent_on_platform_probe_id() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_probe(&probe("p1", Some(111), None)).unwrap();
        store.insert_probe(&probe("p1", Some(999), None)).unwrap();
        let row = store.find_by_platform_ts(Platform::Signal, &[111]).unwrap().unwrap();
        assert_eq!(row.probe_id, "p1");
        assert!(store.find_by_platform_ts(Platform::Signal, &[999]).unwrap().is_none());
    }

    #[test]
    fn ts_lookup_walks_candidates() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_probe(&probe("p1", Some(1_700_000_000_123), None)).unwrap();
        // seconds-flavoured candidate misses, ms-flavoured hits
        let row = store
            .find_by_platform_ts(Platform::Signal, &[1_700_000_000, 1_700_000_000_123])
            .unwrap()
            .unwrap();
        assert_eq!(row.probe_id, "p1");
    }

    #[test]
    fn lookup_is_platform_scoped() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_probe(&probe("p1", Some(42), Some("wamid.1"))).unwrap();
        assert!(store.find_by_platform_ts(Platform::Whatsapp, &[42]).unwrap().is_none());
        assert!(store
            .find_by_platform_message_id(Platform::Whatsapp, "wamid.1")
            .unwrap()
            .is_none());
        assert!(store
            .find_by_platform_message_id(Platform::Signal, "wamid.1")
            .unwrap()
            .is_some());
    }

    #[test]
    fn delivered_and_read_are_set_once() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_probe(&probe("p1", Some(1), None)).unwrap();

        assert!(store.mark_delivered("p1", 100).unwrap());
        assert!(!store.mark_delivered("p1", 200).unwrap());
        let row = store.find_by_platform_ts(Platform::Signal, &[1]).unwrap().unwrap();
        assert_eq!(row.delivered_at_ms, Some(100));

        assert!(store.mark_read("p1", 300).unwrap());
        assert!(!store.mark_read("p1", 400).unwrap());
        let row = store.find_by_platform_ts(Platform::Signal, &[1]).unwrap().unwrap();
        assert_eq!(row.read_at_ms, Some(300));
    }

    #[test]
    fn points_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let point = TrackerPoint {
            timestamp_ms: 123,
            device_id: PRIMARY_DEVICE.into(),
            state: DeviceState::Online,
            rtt_ms: 55.0,
            avg_ms: 60.0,
            median_ms: 50.0,
            threshold_ms: 130.0,
            timeout_streak: Some(0),
            probe_id: Some("p1".into()),
        };
        store.add_point(1, 2, Platform::Mock, &point).unwrap();
        let points = store.recent_points(1, 2, Platform::Mock, 10).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].state, DeviceState::Online);
        assert_eq!(points[0].probe_id.as_deref(), Some("p1"));
    }

    #[test]
    fn open_on_disk_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path).unwrap();
            store.insert_probe(&probe("p1", Some(1), None)).unwrap();
            store.mark_delivered("p1", 100).unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        let row = store.find_by_platform_ts(Platform::Signal, &[1]).unwrap().unwrap();
        assert_eq!(row.delivered_at_ms, Some(100));
    }

    #[test]
    fn contact_directory_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let row = ContactRow {
            id: 7,
            user_id: 1,
            platform: Platform::Whatsapp,
            target: "+4915712345678".into(),
            display_name: "Marc".into(),
            notify_online: true,
            notify_email: Some("me@example.com".into()),
        };
        store.upsert_contact(&row).unwrap();
        let got = store.get_contact(1, 7).unwrap().unwrap();
        assert_eq!(got.target, "+4915712345678");
        assert!(got.notify_online);
        assert_eq!(store.list_contacts(1).unwrap().len(), 1);
        assert!(store.get_contact(2, 7).unwrap().is_none());
    }
}
