//! Deferred instruction execution
//!
//! Instructions nobody could handle at submit time stay Received. This job
//! retries them on each run and expires the ones that have waited longer
//! than the configured limit. Executing instructions that never finished
//! are expired the same way.

use crate::error::ReactorError;
use crate::reactor::InstructionReactor;
use crate::status::{InstructionState, ERROR_CODE_EXPIRED};
use crate::store::StoredInstruction;
use chrono::{DateTime, Utc};
use fieldlink_core::ReactorConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Counts from one job run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Received instructions a handler processed this run
    pub executed: usize,
    /// Received instructions still without a handler
    pub unhandled: usize,
    /// Instructions moved to Declined for exceeding the age limit
    pub expired: usize,
    /// Instructions skipped because of a storage error
    pub failed: usize,
}

pub struct InstructionExecutionJob {
    reactor: Arc<InstructionReactor>,
    maximum_incomplete_age: Duration,
}

impl InstructionExecutionJob {
    pub fn new(reactor: Arc<InstructionReactor>, maximum_incomplete_age: Duration) -> Self {
        Self {
            reactor,
            maximum_incomplete_age,
        }
    }

    pub fn from_config(reactor: Arc<InstructionReactor>, config: &ReactorConfig) -> Self {
        Self::new(reactor, config.maximum_incomplete_age())
    }

    pub fn execute(&self) -> Result<JobSummary, ReactorError> {
        self.execute_at(Utc::now())
    }

    /// Run the job as if the current time were `now`
    pub fn execute_at(&self, now: DateTime<Utc>) -> Result<JobSummary, ReactorError> {
        let mut summary = JobSummary::default();
        let cutoff = self.cutoff(now);
        let store = self.reactor.store();

        for stored in store.find_for_state(InstructionState::Received)? {
            match self.reactor.execute(&stored) {
                Ok(_) => summary.executed += 1,
                Err(ReactorError::Unhandled { .. }) => {
                    if stored.instruction.created_at() < cutoff {
                        if self.expire(&stored, InstructionState::Received)? {
                            summary.expired += 1;
                        }
                    } else {
                        summary.unhandled += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        instruction_id = %stored.instruction.id(),
                        error = %e,
                        "Deferred instruction execution failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        for stored in store.find_for_state(InstructionState::Executing)? {
            if stored.status.status_date < cutoff
                && self.expire(&stored, InstructionState::Executing)?
            {
                summary.expired += 1;
            }
        }

        if summary != JobSummary::default() {
            info!(
                executed = summary.executed,
                unhandled = summary.unhandled,
                expired = summary.expired,
                failed = summary.failed,
                "Instruction execution job finished"
            );
        }
        Ok(summary)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.maximum_incomplete_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn expire(
        &self,
        stored: &StoredInstruction,
        expected: InstructionState,
    ) -> Result<bool, ReactorError> {
        let instruction = &stored.instruction;
        let declined = stored.status.declined(
            format!(
                "instruction not completed within {} hours",
                self.maximum_incomplete_age.as_secs() / 3600
            ),
            Some(ERROR_CODE_EXPIRED),
        );
        let stored_ok = self.reactor.store().compare_and_store_status(
            instruction.id(),
            instruction.instructor_id(),
            expected,
            &declined,
        )?;
        if stored_ok {
            warn!(
                instruction_id = %instruction.id(),
                topic = instruction.topic(),
                from = %expected,
                "Instruction expired"
            );
        }
        Ok(stored_ok)
    }
}
