//! Versioned schema migrations
//!
//! Each store family records its schema version in `schema_meta`. Opening a
//! store applies, in order, every migration step past the recorded version.
//! Step `n` (zero based) upgrades the schema to version `n + 1`.

use crate::error::QueueError;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Recorded schema version for `family`, 0 when never migrated
pub fn schema_version(conn: &Connection, family: &str) -> Result<u32, QueueError> {
    ensure_meta(conn)?;
    let version: Option<u32> = conn
        .query_row(
            "SELECT version FROM schema_meta WHERE family = ?1",
            params![family],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Bring `family` up to `steps.len()`; returns the resulting version
pub(crate) fn migrate(conn: &mut Connection, family: &str, steps: &[&str]) -> Result<u32, QueueError> {
    let current = schema_version(conn, family)?;
    let target = steps.len() as u32;
    if current > target {
        return Err(QueueError::UnsupportedSchema {
            family: family.to_string(),
            found: current,
            supported: target,
        });
    }

    for (idx, sql) in steps.iter().enumerate().skip(current as usize) {
        let version = idx as u32 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_meta (family, version) VALUES (?1, ?2)
             ON CONFLICT(family) DO UPDATE SET version = excluded.version",
            params![family, version],
        )?;
        tx.commit()?;
        info!(family, version, "Applied schema migration");
    }
    Ok(target)
}

fn ensure_meta(conn: &Connection) -> Result<(), QueueError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            family TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}
