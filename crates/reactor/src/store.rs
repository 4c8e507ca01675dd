//! Durable instruction store
//!
//! Instructions and their latest status live in SQLite, keyed by
//! `(instructor_id, id)`. After the initial insert the only way to change a
//! status is [`InstructionStore::compare_and_store_status`], so concurrent
//! writers (the reactor, the execution job, a cancel handler) cannot
//! overwrite each other's transitions.

use crate::error::ReactorError;
use crate::instruction::{
    Instruction, InstructionId, InstructionParameter, LOCAL_INSTRUCTOR_ID, PARAM_PARENT_ID,
};
use crate::status::{InstructionState, InstructionStatus};
use chrono::{DateTime, Utc};
use fieldlink_core::time::{from_epoch_millis, to_epoch_millis};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// An instruction with its latest status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInstruction {
    pub instruction: Instruction,
    pub status: InstructionStatus,
}

/// SQLite-backed instruction store
pub struct InstructionStore {
    conn: Mutex<Connection>,
}

const SELECT_INSTRUCTION: &str = "SELECT instructor_id, id, topic, created_at, state, ack_state, status_date, result_params
     FROM instruction";

impl InstructionStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReactorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;

        info!(path = %path.display(), "Instruction store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self, ReactorError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), ReactorError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instruction (
                instructor_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                topic TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                state TEXT NOT NULL,
                ack_state TEXT,
                status_date INTEGER NOT NULL,
                result_params TEXT,
                PRIMARY KEY (instructor_id, id)
            );

            CREATE TABLE IF NOT EXISTS instruction_param (
                instructor_id TEXT NOT NULL,
                instr_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (instructor_id, instr_id, idx),
                FOREIGN KEY (instructor_id, instr_id)
                    REFERENCES instruction (instructor_id, id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS instruction_seq (
                instructor_id TEXT PRIMARY KEY,
                last_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instruction_state ON instruction(state);
            CREATE INDEX IF NOT EXISTS idx_instruction_param_name ON instruction_param(name, value);
            "#,
        )?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Insert an instruction with its initial status.
    ///
    /// Returns `false` and changes nothing if the instruction already exists.
    pub fn insert(
        &self,
        instruction: &Instruction,
        status: &InstructionStatus,
    ) -> Result<bool, ReactorError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = Self::insert_internal(&tx, instruction, status)?;
        tx.commit()?;
        Ok(inserted)
    }

    fn insert_internal(
        conn: &Connection,
        instruction: &Instruction,
        status: &InstructionStatus,
    ) -> Result<bool, ReactorError> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO instruction
             (instructor_id, id, topic, created_at, state, ack_state, status_date, result_params)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                instruction.instructor_id(),
                instruction.id().0,
                instruction.topic(),
                to_epoch_millis(&instruction.created_at()),
                status.state.as_str(),
                status.acknowledged_state.map(|s| s.as_str()),
                to_epoch_millis(&status.status_date),
                encode_result_params(&status.result_parameters)?,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        let mut stmt = conn.prepare(
            "INSERT INTO instruction_param (instructor_id, instr_id, idx, name, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (idx, param) in instruction.parameters().iter().enumerate() {
            stmt.execute(params![
                instruction.instructor_id(),
                instruction.id().0,
                idx as i64,
                param.name,
                param.value,
            ])?;
        }

        debug!(
            instruction_id = %instruction.id(),
            instructor_id = instruction.instructor_id(),
            topic = instruction.topic(),
            "Instruction stored"
        );
        Ok(true)
    }

    /// Create and store a local instruction with the next local id.
    ///
    /// Local ids come from `instruction_seq`, which purges never touch, so an
    /// id is never handed out twice.
    pub fn insert_local(
        &self,
        topic: &str,
        parameters: Vec<InstructionParameter>,
    ) -> Result<StoredInstruction, ReactorError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        // Rows written before the sequence table existed still count.
        let next_id: i64 = tx.query_row(
            "SELECT MAX(
                 COALESCE((SELECT last_id FROM instruction_seq WHERE instructor_id = ?1), 0),
                 COALESCE((SELECT MAX(id) FROM instruction WHERE instructor_id = ?1), 0)
             ) + 1",
            params![LOCAL_INSTRUCTOR_ID],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO instruction_seq (instructor_id, last_id) VALUES (?1, ?2)
             ON CONFLICT(instructor_id) DO UPDATE SET last_id = excluded.last_id",
            params![LOCAL_INSTRUCTOR_ID, next_id],
        )?;
        let instruction = Instruction::new(next_id, topic, LOCAL_INSTRUCTOR_ID, fieldlink_core::time::now_millis())
            .with_parameters(parameters);
        let status = InstructionStatus::received(instruction.id());
        Self::insert_internal(&tx, &instruction, &status)?;
        tx.commit()?;
        Ok(StoredInstruction {
            instruction,
            status,
        })
    }

    /// Look up an instruction by id for one instructor
    pub fn get(
        &self,
        id: InstructionId,
        instructor_id: &str,
    ) -> Result<Option<StoredInstruction>, ReactorError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_INSTRUCTION} WHERE instructor_id = ?1 AND id = ?2"),
                params![instructor_id, id.0],
                map_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(Self::hydrate(&conn, row)?)),
            None => Ok(None),
        }
    }

    /// Replace the status only if the stored state is still `expected`.
    ///
    /// Returns whether the write happened.
    pub fn compare_and_store_status(
        &self,
        id: InstructionId,
        instructor_id: &str,
        expected: InstructionState,
        status: &InstructionStatus,
    ) -> Result<bool, ReactorError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE instruction SET state = ?1, status_date = ?2, result_params = ?3
             WHERE instructor_id = ?4 AND id = ?5 AND state = ?6",
            params![
                status.state.as_str(),
                to_epoch_millis(&status.status_date),
                encode_result_params(&status.result_parameters)?,
                instructor_id,
                id.0,
                expected.as_str(),
            ],
        )?;
        debug!(
            instruction_id = %id,
            from = %expected,
            to = %status.state,
            stored = changed > 0,
            "Compare-and-store instruction status"
        );
        Ok(changed > 0)
    }

    /// Record the remote authority's confirmed state
    pub fn store_acknowledged(
        &self,
        id: InstructionId,
        instructor_id: &str,
        state: InstructionState,
    ) -> Result<bool, ReactorError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE instruction SET ack_state = ?1 WHERE instructor_id = ?2 AND id = ?3",
            params![state.as_str(), instructor_id, id.0],
        )?;
        Ok(changed > 0)
    }

    /// All instructions currently in `state`, oldest first
    pub fn find_for_state(
        &self,
        state: InstructionState,
    ) -> Result<Vec<StoredInstruction>, ReactorError> {
        self.query_many(
            &format!("{SELECT_INSTRUCTION} WHERE state = ?1 ORDER BY created_at, id"),
            params![state.as_str()],
        )
    }

    /// Local instructions in `state` whose `parentId` parameter is `parent_id`
    pub fn find_for_state_and_parent(
        &self,
        state: InstructionState,
        parent_id: InstructionId,
    ) -> Result<Vec<StoredInstruction>, ReactorError> {
        self.query_many(
            &format!(
                "{SELECT_INSTRUCTION} WHERE state = ?1 AND instructor_id = ?2 AND EXISTS (
                    SELECT 1 FROM instruction_param p
                    WHERE p.instructor_id = instruction.instructor_id
                      AND p.instr_id = instruction.id
                      AND p.name = ?3 AND p.value = ?4)
                 ORDER BY created_at, id"
            ),
            params![
                state.as_str(),
                LOCAL_INSTRUCTOR_ID,
                PARAM_PARENT_ID,
                parent_id.0.to_string()
            ],
        )
    }

    /// Non-local instructions whose state the remote side has not confirmed
    pub fn find_unacknowledged(&self) -> Result<Vec<StoredInstruction>, ReactorError> {
        self.query_many(
            &format!(
                "{SELECT_INSTRUCTION} WHERE instructor_id <> ?1
                   AND (ack_state IS NULL OR ack_state <> state)
                 ORDER BY created_at, id"
            ),
            params![LOCAL_INSTRUCTOR_ID],
        )
    }

    /// Delete terminal instructions whose final state was acknowledged (or
    /// that are local) and whose status is older than `older_than`.
    pub fn purge_handled(&self, older_than: DateTime<Utc>) -> Result<usize, ReactorError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM instruction
             WHERE state IN ('Completed', 'Declined')
               AND (instructor_id = ?1 OR ack_state = state)
               AND status_date < ?2",
            params![LOCAL_INSTRUCTOR_ID, to_epoch_millis(&older_than)],
        )?;
        if deleted > 0 {
            info!(deleted, "Purged handled instructions");
        }
        Ok(deleted)
    }

    fn query_many(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredInstruction>, ReactorError> {
        let conn = self.conn.lock();
        let rows = {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params, map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter()
            .map(|row| Self::hydrate(&conn, row))
            .collect()
    }

    fn hydrate(conn: &Connection, row: InstructionRow) -> Result<StoredInstruction, ReactorError> {
        let mut stmt = conn.prepare(
            "SELECT name, value FROM instruction_param
             WHERE instructor_id = ?1 AND instr_id = ?2 ORDER BY idx",
        )?;
        let parameters = stmt
            .query_map(params![row.instructor_id, row.id], |r| {
                Ok(InstructionParameter {
                    name: r.get(0)?,
                    value: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let id = InstructionId(row.id);
        let status = InstructionStatus {
            instruction_id: id,
            state: parse_state(&row.state)?,
            acknowledged_state: row.ack_state.as_deref().map(parse_state).transpose()?,
            status_date: from_epoch_millis(row.status_date),
            result_parameters: decode_result_params(row.result_params.as_deref())?,
        };
        let instruction = Instruction::new(id, row.topic, row.instructor_id, from_epoch_millis(row.created_at))
            .with_parameters(parameters);
        Ok(StoredInstruction {
            instruction,
            status,
        })
    }
}

struct InstructionRow {
    instructor_id: String,
    id: i64,
    topic: String,
    created_at: i64,
    state: String,
    ack_state: Option<String>,
    status_date: i64,
    result_params: Option<String>,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<InstructionRow> {
    Ok(InstructionRow {
        instructor_id: row.get(0)?,
        id: row.get(1)?,
        topic: row.get(2)?,
        created_at: row.get(3)?,
        state: row.get(4)?,
        ack_state: row.get(5)?,
        status_date: row.get(6)?,
        result_params: row.get(7)?,
    })
}

fn parse_state(s: &str) -> Result<InstructionState, ReactorError> {
    s.parse().map_err(ReactorError::CorruptRecord)
}

fn encode_result_params(params: &BTreeMap<String, String>) -> Result<Option<String>, ReactorError> {
    if params.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(params)?))
}

fn decode_result_params(json: Option<&str>) -> Result<BTreeMap<String, String>, ReactorError> {
    match json {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(BTreeMap::new()),
    }
}
