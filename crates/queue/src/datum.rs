//! Durable store-and-forward queue for captured datum samples
//!
//! Pollers enqueue samples concurrently; a single uploader drains pending
//! records in creation order and marks each one only after the remote
//! service returned a tracking id. Records without a mark are pending and
//! are never purged.

use crate::error::QueueError;
use crate::schema;
use chrono::{DateTime, Utc};
use fieldlink_core::time::{from_epoch_millis, now_millis, to_epoch_millis};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const FAMILY: &str = "datum";

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE datum (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        captured_at INTEGER NOT NULL,
        samples TEXT NOT NULL,
        destination TEXT,
        tracking_id TEXT,
        uploaded_at INTEGER
    );
    CREATE INDEX idx_datum_uploaded_at ON datum(uploaded_at);",
    "ALTER TABLE datum ADD COLUMN quarantined INTEGER NOT NULL DEFAULT 0;",
];

/// One captured sample set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatumSamples {
    /// Point-in-time readings, e.g. watts
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instantaneous: BTreeMap<String, f64>,
    /// Running totals, e.g. watt hours
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accumulating: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status: BTreeMap<String, String>,
}

impl DatumSamples {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instantaneous(mut self, name: impl Into<String>, value: f64) -> Self {
        self.instantaneous.insert(name.into(), value);
        self
    }

    pub fn with_accumulating(mut self, name: impl Into<String>, value: f64) -> Self {
        self.accumulating.insert(name.into(), value);
        self
    }

    pub fn with_status(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.status.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.instantaneous.is_empty() && self.accumulating.is_empty() && self.status.is_empty()
    }

    /// First numeric sample that is NaN or infinite
    fn first_non_finite(&self) -> Option<(&str, f64)> {
        self.instantaneous
            .iter()
            .chain(&self.accumulating)
            .find(|(_, v)| !v.is_finite())
            .map(|(k, v)| (k.as_str(), *v))
    }
}

/// A sample produced by a poll, not yet stored
#[derive(Debug, Clone, PartialEq)]
pub struct Datum {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    pub samples: DatumSamples,
}

impl Datum {
    pub fn new(source_id: impl Into<String>, captured_at: DateTime<Utc>, samples: DatumSamples) -> Self {
        Self {
            source_id: source_id.into(),
            captured_at,
            samples,
        }
    }
}

/// Proof of a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMark {
    pub destination: String,
    pub tracking_id: String,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadMark {
    /// Mark stamped with the current time
    pub fn now(destination: impl Into<String>, tracking_id: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            tracking_id: tracking_id.into(),
            uploaded_at: now_millis(),
        }
    }
}

/// A stored datum
#[derive(Debug, Clone, PartialEq)]
pub struct DurableDatumRecord {
    pub local_id: i64,
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    pub samples: DatumSamples,
    pub upload_mark: Option<UploadMark>,
}

impl DurableDatumRecord {
    pub fn is_pending(&self) -> bool {
        self.upload_mark.is_none()
    }
}

/// SQLite-backed datum queue
pub struct DurableDatumQueue {
    conn: Mutex<Connection>,
}

impl DurableDatumQueue {
    /// Open or create a queue at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let queue = Self::init(conn)?;
        info!(path = %path.display(), pending = queue.count_pending()?, "Datum queue opened");
        Ok(queue)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, QueueError> {
        schema::migrate(&mut conn, FAMILY, MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist a captured datum; returns its local id.
    ///
    /// NaN and infinite readings cannot be stored as JSON and are rejected.
    pub fn enqueue(&self, datum: &Datum) -> Result<i64, QueueError> {
        if let Some((name, value)) = datum.samples.first_non_finite() {
            return Err(QueueError::NonFiniteSample {
                source_id: datum.source_id.clone(),
                name: name.to_string(),
                value,
            });
        }
        let samples = serde_json::to_string(&datum.samples)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO datum (source_id, captured_at, samples) VALUES (?1, ?2, ?3)",
            params![datum.source_id, to_epoch_millis(&datum.captured_at), samples],
        )?;
        let local_id = conn.last_insert_rowid();
        debug!(local_id, source_id = %datum.source_id, "Datum enqueued");
        Ok(local_id)
    }

    /// Up to `limit` pending records, oldest first.
    ///
    /// A row whose samples no longer decode is quarantined and skipped, so it
    /// cannot hold back the records behind it.
    pub fn pending(&self, limit: usize) -> Result<Vec<DurableDatumRecord>, QueueError> {
        let conn = self.conn.lock();
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT local_id, source_id, captured_at, samples, destination, tracking_id, uploaded_at
                 FROM datum WHERE uploaded_at IS NULL AND quarantined = 0
                 ORDER BY local_id LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let local_id = row.local_id;
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(local_id, error = %e, "Undecodable datum quarantined");
                    conn.execute(
                        "UPDATE datum SET quarantined = 1 WHERE local_id = ?1",
                        params![local_id],
                    )?;
                }
            }
        }
        Ok(records)
    }

    /// Records set aside because they could not be decoded
    pub fn count_quarantined(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM datum WHERE quarantined <> 0", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn get(&self, local_id: i64) -> Result<Option<DurableDatumRecord>, QueueError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT local_id, source_id, captured_at, samples, destination, tracking_id, uploaded_at
                 FROM datum WHERE local_id = ?1",
                params![local_id],
                map_row,
            )
            .optional()?;
        row.map(DatumRow::into_record).transpose()
    }

    /// Set the upload mark on a pending record.
    ///
    /// Returns `false` if the record is missing or was already marked.
    pub fn mark_uploaded(&self, local_id: i64, mark: &UploadMark) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE datum SET destination = ?1, tracking_id = ?2, uploaded_at = ?3
             WHERE local_id = ?4 AND uploaded_at IS NULL",
            params![
                mark.destination,
                mark.tracking_id,
                to_epoch_millis(&mark.uploaded_at),
                local_id
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn count_pending(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row(
                "SELECT COUNT(*) FROM datum WHERE uploaded_at IS NULL AND quarantined = 0",
                [],
                |r| r.get(0),
            )?;
        Ok(count as usize)
    }

    /// Delete uploaded records at least `window` old
    pub fn purge(&self, window: Duration) -> Result<usize, QueueError> {
        self.purge_at(window, now_millis())
    }

    /// [`DurableDatumQueue::purge`] evaluated at `now`
    pub fn purge_at(&self, window: Duration, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let cutoff = to_epoch_millis(&now).saturating_sub(window_ms);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM datum WHERE uploaded_at IS NOT NULL AND uploaded_at <= ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            info!(deleted, "Purged uploaded datum");
        }
        Ok(deleted)
    }
}

struct DatumRow {
    local_id: i64,
    source_id: String,
    captured_at: i64,
    samples: String,
    destination: Option<String>,
    tracking_id: Option<String>,
    uploaded_at: Option<i64>,
}

impl DatumRow {
    fn into_record(self) -> Result<DurableDatumRecord, QueueError> {
        let upload_mark = match (self.destination, self.tracking_id, self.uploaded_at) {
            (Some(destination), Some(tracking_id), Some(uploaded_at)) => Some(UploadMark {
                destination,
                tracking_id,
                uploaded_at: from_epoch_millis(uploaded_at),
            }),
            _ => None,
        };
        Ok(DurableDatumRecord {
            local_id: self.local_id,
            source_id: self.source_id,
            captured_at: from_epoch_millis(self.captured_at),
            samples: serde_json::from_str(&self.samples)?,
            upload_mark,
        })
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<DatumRow> {
    Ok(DatumRow {
        local_id: row.get(0)?,
        source_id: row.get(1)?,
        captured_at: row.get(2)?,
        samples: row.get(3)?,
        destination: row.get(4)?,
        tracking_id: row.get(5)?,
        uploaded_at: row.get(6)?,
    })
}
