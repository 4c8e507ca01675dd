//! Queue errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote service or broker could not be reached or refused the item
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bulk upload returned a different number of tracking ids than records sent
    #[error("Upload returned {actual} tracking ids for {expected} records")]
    BatchMismatch { expected: usize, actual: usize },

    /// A store call on the blocking pool panicked or was cancelled
    #[error("Blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A numeric reading was NaN or infinite
    #[error("Datum from {source_id} has non-finite sample {name} = {value}")]
    NonFiniteSample {
        source_id: String,
        name: String,
        value: f64,
    },

    /// The database was written by a newer schema than this build knows
    #[error("Schema {family} is at version {found}, newest supported is {supported}")]
    UnsupportedSchema {
        family: String,
        found: u32,
        supported: u32,
    },
}

impl QueueError {
    /// Failures talking to the far side; the affected records stay pending
    pub fn is_transport(&self) -> bool {
        matches!(self, QueueError::Transport(_) | QueueError::BatchMismatch { .. })
    }
}

impl From<QueueError> for fieldlink_core::Error {
    fn from(err: QueueError) -> Self {
        if err.is_transport() {
            fieldlink_core::Error::Transport(err.to_string())
        } else {
            fieldlink_core::Error::Storage(err.to_string())
        }
    }
}
