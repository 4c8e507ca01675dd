//! JSON wire codec for instructions and their statuses
//!
//! Inbound instructions arrive as an array of
//! `{topic, id, instructionDate, parameters: [{name, value}]}` objects.
//! The instructor is implied by the link they arrived on, so decoding takes
//! it as an argument. `instructionDate` may be RFC 3339 text or epoch
//! milliseconds and defaults to the decode time when absent. Encoding always
//! writes RFC 3339.

use crate::error::ReactorError;
use crate::instruction::{Instruction, InstructionId, InstructionParameter};
use crate::status::{InstructionState, InstructionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstruction {
    topic: String,
    id: WireId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instruction_date: Option<WireDate>,
    #[serde(default)]
    parameters: Vec<InstructionParameter>,
}

/// Ids are numeric but some senders quote them
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireDate {
    EpochMillis(i64),
    Text(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireStatus<'a> {
    instruction_id: InstructionId,
    state: InstructionState,
    status_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    result_parameters: &'a BTreeMap<String, String>,
}

impl WireId {
    fn resolve(self) -> Result<InstructionId, ReactorError> {
        match self {
            WireId::Number(id) => Ok(InstructionId(id)),
            WireId::Text(text) => text
                .trim()
                .parse::<i64>()
                .map(InstructionId)
                .map_err(|_| ReactorError::Decoding(format!("invalid instruction id {text:?}"))),
        }
    }
}

impl WireDate {
    fn resolve(self) -> Result<DateTime<Utc>, ReactorError> {
        match self {
            WireDate::EpochMillis(ms) => Ok(fieldlink_core::time::from_epoch_millis(ms)),
            WireDate::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| ReactorError::Decoding(format!("invalid instructionDate {text:?}: {e}"))),
        }
    }
}

/// Decode an inbound instruction array for `instructor_id`
pub fn decode_instructions(json: &str, instructor_id: &str) -> Result<Vec<Instruction>, ReactorError> {
    let wire: Vec<WireInstruction> =
        serde_json::from_str(json).map_err(|e| ReactorError::Decoding(e.to_string()))?;
    wire.into_iter()
        .map(|w| {
            if w.topic.trim().is_empty() {
                return Err(ReactorError::Decoding("instruction topic is empty".to_string()));
            }
            let id = w.id.resolve()?;
            let created_at = match w.instruction_date {
                Some(date) => date.resolve()?,
                None => fieldlink_core::time::now_millis(),
            };
            Ok(Instruction::new(id, w.topic, instructor_id, created_at).with_parameters(w.parameters))
        })
        .collect()
}

/// Encode instructions in the inbound wire shape
pub fn encode_instructions(instructions: &[Instruction]) -> Result<String, ReactorError> {
    let wire: Vec<WireInstruction> = instructions
        .iter()
        .map(|instr| WireInstruction {
            topic: instr.topic().to_string(),
            id: WireId::Number(instr.id().0),
            instruction_date: Some(WireDate::Text(instr.created_at().to_rfc3339())),
            parameters: instr.parameters().to_vec(),
        })
        .collect();
    Ok(serde_json::to_string(&wire)?)
}

/// Encode statuses for an upstream acknowledgment
pub fn encode_status(statuses: &[InstructionStatus]) -> Result<String, ReactorError> {
    let wire: Vec<WireStatus<'_>> = statuses
        .iter()
        .map(|status| WireStatus {
            instruction_id: status.instruction_id,
            state: status.state,
            status_date: status.status_date,
            result_parameters: &status.result_parameters,
        })
        .collect();
    Ok(serde_json::to_string(&wire)?)
}
