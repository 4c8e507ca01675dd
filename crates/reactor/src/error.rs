//! Reactor errors

use crate::instruction::InstructionId;
use thiserror::Error;

/// Errors raised by the reactor and its store.
///
/// Handler faults never appear here: they become Declined statuses.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed inbound instruction payload
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// No registered handler accepts the topic; the instruction stays Received
    #[error("No handler for topic {topic} (instruction {instruction_id})")]
    Unhandled {
        instruction_id: InstructionId,
        topic: String,
    },

    #[error("Instruction {instruction_id} from {instructor_id} not found")]
    NotFound {
        instruction_id: InstructionId,
        instructor_id: String,
    },

    /// A stored row could not be interpreted
    #[error("Corrupt instruction record: {0}")]
    CorruptRecord(String),
}

impl From<ReactorError> for fieldlink_core::Error {
    fn from(err: ReactorError) -> Self {
        use fieldlink_core::Error;
        match err {
            ReactorError::Decoding(msg) => Error::Decoding(msg),
            ReactorError::Serialization(e) => Error::Decoding(e.to_string()),
            ReactorError::Unhandled {
                instruction_id,
                topic,
            } => Error::UnhandledInstruction {
                instruction_id: instruction_id.to_string(),
                topic,
            },
            other => Error::Storage(other.to_string()),
        }
    }
}
