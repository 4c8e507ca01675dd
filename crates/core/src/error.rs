//! Cross-crate error taxonomy
//!
//! Every crate in the workspace has its own error enum; each converts into
//! [`Error`] so that a poll or handler boundary can classify a failure
//! without knowing which subsystem produced it.

use std::time::Duration;
use thiserror::Error;

/// Classified gateway error
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure talking to a device or the remote service
    #[error("Transport error: {0}")]
    Transport(String),

    /// Channel contention exceeded the wait bound
    #[error("Lock timeout on channel {channel} after {waited:?}")]
    LockTimeout {
        /// Channel that could not be leased
        channel: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Malformed wire payload
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Deliberate business-rule rejection
    #[error("Instruction {instruction_id} declined: {message}")]
    HandlerDeclined {
        /// Declined instruction
        instruction_id: String,
        /// Reason given by the handler
        message: String,
    },

    /// No capable handler found for a topic
    #[error("No handler for topic {topic} (instruction {instruction_id})")]
    UnhandledInstruction {
        /// Unclaimed instruction
        instruction_id: String,
        /// Topic nobody accepted
        topic: String,
    },

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether an automatic retry on a later cycle makes sense.
    ///
    /// Declined instructions are terminal. Contention, I/O failures and
    /// unclaimed topics may succeed on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::LockTimeout { .. } | Error::UnhandledInstruction { .. }
        )
    }

    /// Whether this is a lock timeout rather than a hardware fault
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Result alias using the gateway error taxonomy
pub type Result<T> = std::result::Result<T, Error>;
