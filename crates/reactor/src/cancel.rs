//! `CancelInstruction` topic handler

use crate::instruction::{Instruction, InstructionId, PARAM_ID, TOPIC_CANCEL_INSTRUCTION};
use crate::handler::{HandlerOutcome, InstructionHandler};
use crate::status::InstructionState;
use crate::store::InstructionStore;
use std::sync::Arc;
use tracing::info;

/// Declines a pending instruction from the same instructor, plus any local
/// child instructions still waiting on it.
pub struct CancelInstructionHandler {
    store: Arc<InstructionStore>,
}

impl CancelInstructionHandler {
    pub fn new(store: Arc<InstructionStore>) -> Self {
        Self { store }
    }

    fn cancel(
        &self,
        target: InstructionId,
        instructor_id: &str,
        cancelled_by: InstructionId,
    ) -> anyhow::Result<HandlerOutcome> {
        let Some(stored) = self.store.get(target, instructor_id)? else {
            return Ok(HandlerOutcome::reply(
                InstructionState::Declined,
                404,
                format!("instruction {target} not found"),
            ));
        };

        let current = stored.status.state;
        if current.is_terminal() {
            return Ok(HandlerOutcome::reply(
                InstructionState::Declined,
                409,
                format!("instruction {target} already {current}"),
            ));
        }

        let message = format!("cancelled by instruction {cancelled_by}");
        let declined = stored.status.declined(message.as_str(), None);
        if !self
            .store
            .compare_and_store_status(target, instructor_id, current, &declined)?
        {
            return Ok(HandlerOutcome::reply(
                InstructionState::Declined,
                409,
                format!("instruction {target} changed state during cancel"),
            ));
        }

        let mut children = 0;
        for child in self
            .store
            .find_for_state_and_parent(InstructionState::Received, target)?
        {
            let child_declined = child.status.declined(message.as_str(), None);
            if self.store.compare_and_store_status(
                child.instruction.id(),
                child.instruction.instructor_id(),
                InstructionState::Received,
                &child_declined,
            )? {
                children += 1;
            }
        }

        info!(%target, instructor_id, children, "Instruction cancelled");
        Ok(HandlerOutcome::completed())
    }
}

impl InstructionHandler for CancelInstructionHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == TOPIC_CANCEL_INSTRUCTION
    }

    fn process_instruction(&self, instruction: &Instruction) -> anyhow::Result<HandlerOutcome> {
        let target = match instruction.parameter_value(PARAM_ID).map(str::parse::<i64>) {
            Some(Ok(id)) => InstructionId(id),
            Some(Err(_)) | None => {
                return Ok(HandlerOutcome::reply(
                    InstructionState::Declined,
                    400,
                    format!("missing or invalid {PARAM_ID} parameter"),
                ))
            }
        };
        self.cancel(target, instruction.instructor_id(), instruction.id())
    }
}
