//! Instruction status snapshots
//!
//! A status is never changed in place. Every transition produces a new
//! snapshot so earlier ones stay valid for audit and logging.

use crate::instruction::InstructionId;
use chrono::{DateTime, Utc};
use fieldlink_core::time::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Result parameter carrying a human-readable message
pub const PARAM_MESSAGE: &str = "message";

/// Result parameter carrying a machine-readable error code
pub const PARAM_ERROR_CODE: &str = "code";

/// Result parameter carrying an HTTP-style status code
pub const PARAM_STATUS_CODE: &str = "statusCode";

/// Error code for instructions that stayed incomplete too long
pub const ERROR_CODE_EXPIRED: &str = "E_EXPIRED";

/// Error code for handlers that exceeded their execution bound
pub const ERROR_CODE_TIMEOUT: &str = "E_TIMEOUT";

/// Error code for handler faults
pub const ERROR_CODE_HANDLER_FAULT: &str = "E_HANDLER";

/// Instruction lifecycle state.
///
/// ```text
/// Received -> Executing -> Completed
///     |           |
///     +-----------+-----> Declined
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionState {
    Received,
    Executing,
    Declined,
    Completed,
}

impl InstructionState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstructionState::Declined | InstructionState::Completed)
    }

    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_transition_to(&self, next: InstructionState) -> bool {
        use InstructionState::*;
        matches!(
            (self, next),
            (Received, Executing) | (Received, Declined) | (Executing, Declined) | (Executing, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionState::Received => "Received",
            InstructionState::Executing => "Executing",
            InstructionState::Declined => "Declined",
            InstructionState::Completed => "Completed",
        }
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstructionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Received" => Ok(InstructionState::Received),
            "Executing" => Ok(InstructionState::Executing),
            "Declined" => Ok(InstructionState::Declined),
            "Completed" => Ok(InstructionState::Completed),
            other => Err(format!("unknown instruction state {other}")),
        }
    }
}

/// Immutable status snapshot for one instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionStatus {
    pub instruction_id: InstructionId,
    /// Local execution outcome
    pub state: InstructionState,
    /// State the remote authority confirmed receiving
    pub acknowledged_state: Option<InstructionState>,
    pub status_date: DateTime<Utc>,
    pub result_parameters: BTreeMap<String, String>,
}

impl InstructionStatus {
    /// Initial snapshot for a newly received instruction
    pub fn received(instruction_id: InstructionId) -> Self {
        Self {
            instruction_id,
            state: InstructionState::Received,
            acknowledged_state: None,
            status_date: now_millis(),
            result_parameters: BTreeMap::new(),
        }
    }

    /// Copy with a new state and fresh status date.
    ///
    /// Does not check the lifecycle; see [`InstructionStatus::transition`].
    pub fn with_state(&self, state: InstructionState) -> Self {
        Self {
            state,
            status_date: now_millis(),
            ..self.clone()
        }
    }

    /// Copy moved along a lifecycle edge, or `None` if `next` is not reachable
    pub fn transition(&self, next: InstructionState) -> Option<Self> {
        self.state
            .can_transition_to(next)
            .then(|| self.with_state(next))
    }

    /// Copy with the remote authority's confirmed state
    pub fn with_acknowledged(&self, state: InstructionState) -> Self {
        Self {
            acknowledged_state: Some(state),
            ..self.clone()
        }
    }

    /// Copy with one more result parameter
    pub fn with_result_parameter(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.result_parameters.insert(name.into(), value.into());
        next
    }

    /// Copy with result parameters merged in
    pub fn with_result_parameters(&self, params: &BTreeMap<String, String>) -> Self {
        let mut next = self.clone();
        next.result_parameters
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        next
    }

    /// Declined copy carrying a message and optional error code
    pub fn declined(&self, message: impl Into<String>, code: Option<&str>) -> Self {
        let mut next = self
            .with_state(InstructionState::Declined)
            .with_result_parameter(PARAM_MESSAGE, message);
        if let Some(code) = code {
            next = next.with_result_parameter(PARAM_ERROR_CODE, code);
        }
        next
    }

    pub fn message(&self) -> Option<&str> {
        self.result_parameters.get(PARAM_MESSAGE).map(String::as_str)
    }

    /// Whether the remote side still needs to hear about this status
    pub fn needs_acknowledgment(&self) -> bool {
        self.acknowledged_state != Some(self.state)
    }
}
