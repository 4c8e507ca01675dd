//! Instruction reactor
//!
//! The reactor owns instruction identity and state transitions:
//!
//! 1. `submit` stores the instruction as Received (or returns the status
//!    already recorded for that id, without executing anything again)
//! 2. the first capable handler is looked up; without one the instruction
//!    stays Received and [`ReactorError::Unhandled`] is returned
//! 3. the status moves to Executing and the handler runs on the caller's
//!    thread, optionally bounded by a timeout
//! 4. the handler outcome is applied; faults become Declined
//!
//! Acknowledgments from the remote side are recorded separately and never
//! touch the local state.

use crate::error::ReactorError;
use crate::handler::{Dispatcher, HandlerOutcome, InstructionHandler};
use crate::instruction::{Instruction, InstructionId};
use crate::status::{
    InstructionState, InstructionStatus, ERROR_CODE_HANDLER_FAULT, ERROR_CODE_TIMEOUT,
};
use crate::store::{InstructionStore, StoredInstruction};
use fieldlink_core::ReactorConfig;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a handler invocation produced no outcome
enum HandlerFailure {
    Fault(String),
    TimedOut(Duration),
}

pub struct InstructionReactor {
    store: Arc<InstructionStore>,
    dispatcher: Dispatcher,
    handler_timeout: Option<Duration>,
}

impl InstructionReactor {
    pub fn new(store: Arc<InstructionStore>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            dispatcher,
            handler_timeout: None,
        }
    }

    /// Bound each handler invocation; a handler that overruns is Declined.
    ///
    /// The overrunning handler keeps running on its worker thread but its
    /// result is discarded.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Apply the `[reactor]` configuration section
    pub fn configured(self, config: &ReactorConfig) -> Self {
        self.with_handler_timeout(config.handler_timeout())
    }

    pub fn store(&self) -> &Arc<InstructionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Accept an instruction and execute it synchronously.
    ///
    /// Idempotent by `(instructor_id, id)`.
    pub fn submit(&self, instruction: Instruction) -> Result<InstructionStatus, ReactorError> {
        let received = InstructionStatus::received(instruction.id());
        if !self.store.insert(&instruction, &received)? {
            let existing = self.store.get(instruction.id(), instruction.instructor_id())?.ok_or_else(|| {
                ReactorError::NotFound {
                    instruction_id: instruction.id(),
                    instructor_id: instruction.instructor_id().to_string(),
                }
            })?;
            debug!(
                instruction_id = %instruction.id(),
                state = %existing.status.state,
                "Duplicate instruction; returning recorded status"
            );
            return Ok(existing.status);
        }

        info!(
            instruction_id = %instruction.id(),
            instructor_id = instruction.instructor_id(),
            topic = instruction.topic(),
            "Instruction received"
        );
        self.execute(&StoredInstruction {
            instruction,
            status: received,
        })
    }

    /// Execute a stored instruction that is currently Received.
    ///
    /// Used by [`InstructionReactor::submit`] and by the deferred execution
    /// job. If another writer moved the instruction first, the status it
    /// stored is returned unchanged.
    pub fn execute(&self, stored: &StoredInstruction) -> Result<InstructionStatus, ReactorError> {
        let instruction = &stored.instruction;
        let Some(handler) = self.dispatcher.find(instruction.topic()).cloned() else {
            warn!(
                instruction_id = %instruction.id(),
                topic = instruction.topic(),
                "No handler accepts instruction topic"
            );
            return Err(ReactorError::Unhandled {
                instruction_id: instruction.id(),
                topic: instruction.topic().to_string(),
            });
        };

        let Some(executing) = stored.status.transition(InstructionState::Executing) else {
            return Ok(stored.status.clone());
        };
        if !self.store.compare_and_store_status(
            instruction.id(),
            instruction.instructor_id(),
            InstructionState::Received,
            &executing,
        )? {
            return self.current_status(instruction);
        }

        let result = match self.invoke(handler, instruction) {
            Ok(outcome) => self.resolve(instruction, &executing, outcome),
            Err(HandlerFailure::Fault(message)) => {
                warn!(instruction_id = %instruction.id(), error = %message, "Instruction handler failed");
                executing.declined(message, Some(ERROR_CODE_HANDLER_FAULT))
            }
            Err(HandlerFailure::TimedOut(limit)) => {
                warn!(instruction_id = %instruction.id(), ?limit, "Instruction handler timed out");
                executing.declined(
                    format!("handler did not finish within {limit:?}"),
                    Some(ERROR_CODE_TIMEOUT),
                )
            }
        };

        if result.state == InstructionState::Executing {
            // Handler accepted the work and will finish it later.
            return Ok(executing);
        }
        if !self.store.compare_and_store_status(
            instruction.id(),
            instruction.instructor_id(),
            InstructionState::Executing,
            &result,
        )? {
            return self.current_status(instruction);
        }

        info!(
            instruction_id = %instruction.id(),
            state = %result.state,
            "Instruction handled"
        );
        Ok(result)
    }

    fn resolve(
        &self,
        instruction: &Instruction,
        executing: &InstructionStatus,
        outcome: HandlerOutcome,
    ) -> InstructionStatus {
        let next = outcome.state();
        if next == InstructionState::Executing || executing.state.can_transition_to(next) {
            outcome.apply(executing)
        } else {
            warn!(
                instruction_id = %instruction.id(),
                state = %next,
                "Handler returned a state that cannot follow Executing"
            );
            executing.declined(
                format!("handler returned invalid state {next}"),
                Some(ERROR_CODE_HANDLER_FAULT),
            )
        }
    }

    fn invoke(
        &self,
        handler: Arc<dyn InstructionHandler>,
        instruction: &Instruction,
    ) -> Result<HandlerOutcome, HandlerFailure> {
        let Some(limit) = self.handler_timeout else {
            return run_handler(handler.as_ref(), instruction);
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let owned = instruction.clone();
        let spawned = thread::Builder::new()
            .name(format!("instruction-{}", instruction.id()))
            .spawn(move || {
                let _ = tx.send(run_handler(handler.as_ref(), &owned));
            });
        if let Err(e) = spawned {
            return Err(HandlerFailure::Fault(format!("could not start handler: {e}")));
        }

        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(HandlerFailure::TimedOut(limit)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(HandlerFailure::Fault("handler thread exited without a result".to_string()))
            }
        }
    }

    /// Record the remote authority's confirmed state without touching the
    /// local state.
    pub fn acknowledge(
        &self,
        instruction_id: InstructionId,
        instructor_id: &str,
        remote_state: InstructionState,
    ) -> Result<InstructionStatus, ReactorError> {
        if !self
            .store
            .store_acknowledged(instruction_id, instructor_id, remote_state)?
        {
            return Err(ReactorError::NotFound {
                instruction_id,
                instructor_id: instructor_id.to_string(),
            });
        }
        debug!(%instruction_id, acknowledged = %remote_state, "Instruction acknowledged");
        self.status(instruction_id, instructor_id)?
            .ok_or_else(|| ReactorError::NotFound {
                instruction_id,
                instructor_id: instructor_id.to_string(),
            })
    }

    /// Latest recorded status
    pub fn status(
        &self,
        instruction_id: InstructionId,
        instructor_id: &str,
    ) -> Result<Option<InstructionStatus>, ReactorError> {
        Ok(self
            .store
            .get(instruction_id, instructor_id)?
            .map(|stored| stored.status))
    }

    /// Statuses the remote side has not yet confirmed
    pub fn pending_acknowledgments(&self) -> Result<Vec<InstructionStatus>, ReactorError> {
        Ok(self
            .store
            .find_unacknowledged()?
            .into_iter()
            .map(|stored| stored.status)
            .collect())
    }

    fn current_status(&self, instruction: &Instruction) -> Result<InstructionStatus, ReactorError> {
        self.status(instruction.id(), instruction.instructor_id())?
            .ok_or_else(|| ReactorError::NotFound {
                instruction_id: instruction.id(),
                instructor_id: instruction.instructor_id().to_string(),
            })
    }
}

fn run_handler(
    handler: &dyn InstructionHandler,
    instruction: &Instruction,
) -> Result<HandlerOutcome, HandlerFailure> {
    match catch_unwind(AssertUnwindSafe(|| handler.process_instruction(instruction))) {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(HandlerFailure::Fault(format!("{e:#}"))),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerFailure::Fault(message))
        }
    }
}
