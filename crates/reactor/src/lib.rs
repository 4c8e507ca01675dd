//! Instruction handling for fieldlink nodes.
//!
//! Instructions arrive from a remote authority (or are created locally),
//! are persisted with their status, and are routed by topic to the first
//! capable [`InstructionHandler`]. Each instruction moves through
//! Received, Executing and then Completed or Declined; remote
//! acknowledgments are tracked beside the local state.

pub mod cancel;
pub mod error;
pub mod execution;
pub mod handler;
pub mod instruction;
pub mod reactor;
pub mod status;
pub mod store;
pub mod wire;

pub use cancel::CancelInstructionHandler;
pub use error::ReactorError;
pub use execution::{InstructionExecutionJob, JobSummary};
pub use handler::{CompositeHandler, Dispatcher, HandlerOutcome, InstructionHandler};
pub use instruction::{Instruction, InstructionId, InstructionParameter};
pub use reactor::InstructionReactor;
pub use status::{InstructionState, InstructionStatus};
pub use store::{InstructionStore, StoredInstruction};
pub use wire::{decode_instructions, encode_instructions, encode_status};
