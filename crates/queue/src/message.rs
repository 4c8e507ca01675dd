//! Durable outbound message queue
//!
//! A message is stored before any send attempt and deleted only once the
//! broker confirmed delivery. The queue keeps process-wide counters of
//! stored and deleted messages.

use crate::error::QueueError;
use crate::schema;
use chrono::{DateTime, Utc};
use fieldlink_core::time::{from_epoch_millis, now_millis, to_epoch_millis};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const FAMILY: &str = "message";

pub(crate) const MIGRATIONS: &[&str] = &[
    "CREATE TABLE message (
        local_id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        qos INTEGER NOT NULL,
        retained INTEGER NOT NULL,
        payload BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );",
    "ALTER TABLE message ADD COLUMN destination TEXT NOT NULL DEFAULT '';
    CREATE INDEX idx_message_destination ON message(destination, local_id);",
];

const SELECT_MESSAGE: &str =
    "SELECT local_id, destination, topic, qos, retained, payload, created_at FROM message";

/// A message to be stored for sending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub destination: String,
    pub topic: String,
    pub qos: u8,
    pub retained: bool,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<String>, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination: destination.into(),
            topic: topic.into(),
            qos: 0,
            retained: false,
            payload: payload.into(),
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// A stored message awaiting delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableMessageRecord {
    pub local_id: i64,
    pub destination: String,
    pub topic: String,
    pub qos: u8,
    pub retained: bool,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Stored/deleted counters since the queue was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    pub stored: u64,
    pub deleted: u64,
}

/// What [`DurableMessageQueue::batch_process`] does after each record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Continue,
    /// Delete the record, counting it as delivered
    Delete,
    Stop,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Only records for this destination
    pub destination: Option<String>,
    pub max_results: usize,
}

impl BatchOptions {
    pub fn new(max_results: usize) -> Self {
        Self {
            destination: None,
            max_results,
        }
    }

    pub fn for_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub processed: usize,
    pub deleted: usize,
}

/// Sortable columns for [`DurableMessageQueue::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Id,
    Created,
    Topic,
    Destination,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            SortKey::Id => "local_id",
            SortKey::Created => "created_at",
            SortKey::Topic => "topic",
            SortKey::Destination => "destination",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: SortKey,
    pub descending: bool,
}

impl SortDescriptor {
    pub fn asc(key: SortKey) -> Self {
        Self { key, descending: false }
    }

    pub fn desc(key: SortKey) -> Self {
        Self { key, descending: true }
    }
}

pub struct DurableMessageQueue {
    conn: Mutex<Connection>,
    stored: AtomicU64,
    deleted: AtomicU64,
}

impl DurableMessageQueue {
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
        info!(path = %path.display(), stored = queue.count()?, "Message queue opened");
        Ok(queue)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, QueueError> {
        schema::migrate(&mut conn, FAMILY, MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
            stored: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        })
    }

    /// Store a message before it is sent
    pub fn persist(&self, message: &OutboundMessage) -> Result<DurableMessageRecord, QueueError> {
        let created_at = now_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO message (destination, topic, qos, retained, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.destination,
                message.topic,
                message.qos,
                message.retained,
                message.payload,
                to_epoch_millis(&created_at),
            ],
        )?;
        let local_id = conn.last_insert_rowid();
        self.stored.fetch_add(1, Ordering::Relaxed);
        debug!(local_id, topic = %message.topic, destination = %message.destination, "Message stored");
        Ok(DurableMessageRecord {
            local_id,
            destination: message.destination.clone(),
            topic: message.topic.clone(),
            qos: message.qos,
            retained: message.retained,
            payload: message.payload.clone(),
            created_at,
        })
    }

    /// Delete a delivered message; `false` when it was already gone
    pub fn confirm_delivery(&self, local_id: i64) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        let deleted = Self::delete(&conn, local_id)?;
        if deleted {
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(deleted)
    }

    fn delete(conn: &Connection, local_id: i64) -> Result<bool, QueueError> {
        Ok(conn.execute("DELETE FROM message WHERE local_id = ?1", params![local_id])? > 0)
    }

    pub fn stats(&self) -> MessageStats {
        MessageStats {
            stored: self.stored.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }

    pub fn get(&self, local_id: i64) -> Result<Option<DurableMessageRecord>, QueueError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE local_id = ?1"),
                params![local_id],
                map_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Stored messages for one destination
    pub fn count_for(&self, destination: &str) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message WHERE destination = ?1",
            params![destination],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Oldest stored messages for `destination`, up to `limit`
    pub fn pending_for(&self, destination: &str, limit: usize) -> Result<Vec<DurableMessageRecord>, QueueError> {
        self.select(
            &BatchOptions::new(limit).for_destination(destination),
        )
    }

    fn select(&self, options: &BatchOptions) -> Result<Vec<DurableMessageRecord>, QueueError> {
        let conn = self.conn.lock();
        let limit = options.max_results as i64;
        let records = match &options.destination {
            Some(destination) => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_MESSAGE} WHERE destination = ?1 ORDER BY local_id LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![destination, limit], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!("{SELECT_MESSAGE} ORDER BY local_id LIMIT ?1"))?;
                let rows = stmt
                    .query_map(params![limit], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(records)
    }

    /// Walk stored records in id order, letting `callback` decide each one.
    ///
    /// The store is not locked while the callback runs.
    pub fn batch_process<F>(&self, options: &BatchOptions, mut callback: F) -> Result<BatchResult, QueueError>
    where
        F: FnMut(&DurableMessageRecord) -> BatchAction,
    {
        let mut result = BatchResult::default();
        for record in self.select(options)? {
            result.processed += 1;
            match callback(&record) {
                BatchAction::Continue => {}
                BatchAction::Delete => {
                    if self.confirm_delivery(record.local_id)? {
                        result.deleted += 1;
                    }
                }
                BatchAction::Stop => break,
            }
        }
        Ok(result)
    }

    /// Paged listing for inspection.
    ///
    /// An empty `sort` lists newest first. Ties always fall back to id.
    pub fn find(
        &self,
        sort: &[SortDescriptor],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DurableMessageRecord>, QueueError> {
        let order = order_clause(sort);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_MESSAGE} ORDER BY {order} LIMIT ?1 OFFSET ?2"))?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn order_clause(sort: &[SortDescriptor]) -> String {
    if sort.is_empty() {
        return "created_at DESC, local_id DESC".to_string();
    }
    let mut parts: Vec<String> = sort
        .iter()
        .map(|s| format!("{} {}", s.key.column(), if s.descending { "DESC" } else { "ASC" }))
        .collect();
    if !sort.iter().any(|s| s.key == SortKey::Id) {
        let id_desc = sort.last().map(|s| s.descending).unwrap_or(true);
        parts.push(format!("local_id {}", if id_desc { "DESC" } else { "ASC" }));
    }
    parts.join(", ")
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<DurableMessageRecord> {
    Ok(DurableMessageRecord {
        local_id: row.get(0)?,
        destination: row.get(1)?,
        topic: row.get(2)?,
        qos: row.get(3)?,
        retained: row.get(4)?,
        payload: row.get(5)?,
        created_at: from_epoch_millis(row.get(6)?),
    })
}
