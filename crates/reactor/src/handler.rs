//! Instruction handlers and first-match dispatch
//!
//! A [`Dispatcher`] holds handlers in registration order and routes each
//! instruction to the first one whose [`InstructionHandler::handles_topic`]
//! returns true. It never falls through to a later handler, even when the
//! first capable one declines.

use crate::instruction::{Instruction, PARAM_SERVICE};
use crate::status::{InstructionState, InstructionStatus, PARAM_MESSAGE, PARAM_STATUS_CODE};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// What a handler decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Bare result state
    State(InstructionState),
    /// Result state plus result parameters (status code, message, ...)
    Status {
        state: InstructionState,
        result_parameters: BTreeMap<String, String>,
    },
}

impl HandlerOutcome {
    pub fn completed() -> Self {
        HandlerOutcome::State(InstructionState::Completed)
    }

    pub fn declined() -> Self {
        HandlerOutcome::State(InstructionState::Declined)
    }

    /// Structured reply with an HTTP-style status code and message
    pub fn reply(state: InstructionState, status_code: u16, message: impl Into<String>) -> Self {
        let mut result_parameters = BTreeMap::new();
        result_parameters.insert(PARAM_STATUS_CODE.to_string(), status_code.to_string());
        result_parameters.insert(PARAM_MESSAGE.to_string(), message.into());
        HandlerOutcome::Status {
            state,
            result_parameters,
        }
    }

    pub fn state(&self) -> InstructionState {
        match self {
            HandlerOutcome::State(state) => *state,
            HandlerOutcome::Status { state, .. } => *state,
        }
    }

    /// Apply this outcome to an Executing snapshot
    pub(crate) fn apply(&self, executing: &InstructionStatus) -> InstructionStatus {
        match self {
            HandlerOutcome::State(state) => executing.with_state(*state),
            HandlerOutcome::Status {
                state,
                result_parameters,
            } => executing
                .with_state(*state)
                .with_result_parameters(result_parameters),
        }
    }
}

/// A capability for processing instructions of some topics.
///
/// Returning an error is a handler fault: the reactor turns it into a
/// Declined status carrying the error text as its message.
pub trait InstructionHandler: Send + Sync {
    /// Whether this handler accepts `topic`
    fn handles_topic(&self, topic: &str) -> bool;

    /// Process an instruction whose topic this handler accepts
    fn process_instruction(&self, instruction: &Instruction) -> anyhow::Result<HandlerOutcome>;
}

/// Ordered handler registry
#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: Vec<Arc<dyn InstructionHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; earlier registrations win
    pub fn register(&mut self, handler: Arc<dyn InstructionHandler>) {
        self.handlers.push(handler);
    }

    /// Builder-style [`Dispatcher::register`]
    pub fn with_handler(mut self, handler: Arc<dyn InstructionHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// First handler accepting `topic`
    pub fn find(&self, topic: &str) -> Option<&Arc<dyn InstructionHandler>> {
        self.handlers.iter().find(|h| h.handles_topic(topic))
    }

    /// Route `instruction` by its topic; `None` when nobody accepts it
    pub fn dispatch(&self, instruction: &Instruction) -> Option<anyhow::Result<HandlerOutcome>> {
        self.dispatch_on(instruction.topic(), instruction)
    }

    /// Route `instruction` by an arbitrary key (used for nested dispatch)
    pub fn dispatch_on(
        &self,
        key: &str,
        instruction: &Instruction,
    ) -> Option<anyhow::Result<HandlerOutcome>> {
        let handler = self.find(key)?;
        debug!(instruction_id = %instruction.id(), key, "Dispatching instruction");
        Some(handler.process_instruction(instruction))
    }
}

/// One topic whose sub-operations are chosen by a secondary parameter.
///
/// Sub-handlers are asked `handles_topic(<parameter value>)`, so the same
/// first-match rule applies one level down.
pub struct CompositeHandler {
    topic: String,
    parameter: String,
    services: Dispatcher,
}

impl CompositeHandler {
    /// Sub-dispatch on the `service` parameter
    pub fn new(topic: impl Into<String>, services: Dispatcher) -> Self {
        Self::with_parameter(topic, PARAM_SERVICE, services)
    }

    pub fn with_parameter(
        topic: impl Into<String>,
        parameter: impl Into<String>,
        services: Dispatcher,
    ) -> Self {
        Self {
            topic: topic.into(),
            parameter: parameter.into(),
            services,
        }
    }
}

impl InstructionHandler for CompositeHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == self.topic
    }

    fn process_instruction(&self, instruction: &Instruction) -> anyhow::Result<HandlerOutcome> {
        let Some(service) = instruction.parameter_value(&self.parameter) else {
            return Ok(HandlerOutcome::reply(
                InstructionState::Declined,
                400,
                format!("missing {} parameter", self.parameter),
            ));
        };
        match self.services.dispatch_on(service, instruction) {
            Some(outcome) => outcome,
            None => Ok(HandlerOutcome::reply(
                InstructionState::Declined,
                404,
                format!("unsupported {} {}", self.parameter, service),
            )),
        }
    }
}
