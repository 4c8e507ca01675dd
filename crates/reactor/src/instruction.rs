//! Instruction model
//!
//! Instructions are immutable once built. Parameters form an ordered
//! multi-map: the same name may appear more than once and insertion order is
//! preserved for encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instructor id used for locally originated instructions
pub const LOCAL_INSTRUCTOR_ID: &str = "LOCAL";

/// Topic for setting a control value
pub const TOPIC_SET_CONTROL_PARAMETER: &str = "SetControlParameter";

/// Topic for cancelling an earlier instruction
pub const TOPIC_CANCEL_INSTRUCTION: &str = "CancelInstruction";

/// Parameter naming the instruction to cancel
pub const PARAM_ID: &str = "id";

/// Parameter linking a local child instruction to its parent
pub const PARAM_PARENT_ID: &str = "parentId";

/// Parameter selecting a sub-operation within a composite topic
pub const PARAM_SERVICE: &str = "service";

/// Instruction identifier, unique per instructor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstructionId(pub i64);

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for InstructionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A single named parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionParameter {
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: String,
}

impl InstructionParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A command addressed by topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    id: InstructionId,
    topic: String,
    instructor_id: String,
    created_at: DateTime<Utc>,
    parameters: Vec<InstructionParameter>,
}

impl Instruction {
    /// Create an instruction with no parameters
    pub fn new(
        id: impl Into<InstructionId>,
        topic: impl Into<String>,
        instructor_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            instructor_id: instructor_id.into(),
            created_at,
            parameters: Vec::new(),
        }
    }

    /// Append a parameter, consuming and returning the instruction
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(InstructionParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Replace all parameters
    pub fn with_parameters(mut self, parameters: Vec<InstructionParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn id(&self) -> InstructionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn instructor_id(&self) -> &str {
        &self.instructor_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_local(&self) -> bool {
        self.instructor_id == LOCAL_INSTRUCTOR_ID
    }

    pub fn parameters(&self) -> &[InstructionParameter] {
        &self.parameters
    }

    /// First value for `name`
    pub fn parameter_value(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// All values for `name`, in order
    pub fn parameter_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.parameters
            .iter()
            .filter(move |p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Distinct parameter names in first-seen order
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for p in &self.parameters {
            if !names.contains(&p.name.as_str()) {
                names.push(&p.name);
            }
        }
        names
    }

    /// Parent instruction id carried in `parentId`, if any
    pub fn parent_id(&self) -> Option<InstructionId> {
        self.parameter_value(PARAM_PARENT_ID)
            .and_then(|v| v.parse::<i64>().ok())
            .map(InstructionId)
    }
}
