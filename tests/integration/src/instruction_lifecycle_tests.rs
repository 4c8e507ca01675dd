//! Instruction lifecycle from wire payload to acknowledgment

use crate::test_utils::{init_tracing, remove_db, temp_db_path};
use chrono::Utc;
use fieldlink_core::ReactorConfig;
use fieldlink_reactor::instruction::{LOCAL_INSTRUCTOR_ID, TOPIC_CANCEL_INSTRUCTION, TOPIC_SET_CONTROL_PARAMETER};
use fieldlink_reactor::{
    decode_instructions, encode_status, CancelInstructionHandler, CompositeHandler, Dispatcher,
    HandlerOutcome, Instruction, InstructionExecutionJob, InstructionHandler, InstructionId,
    InstructionReactor, InstructionState, InstructionStore, ReactorError,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Writes control values and records each write as a local instruction
#[derive(Default)]
struct ControlToggleHandler {
    next_id: AtomicI64,
    writes: Mutex<Vec<Instruction>>,
}

impl InstructionHandler for ControlToggleHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == TOPIC_SET_CONTROL_PARAMETER
    }

    fn process_instruction(&self, instruction: &Instruction) -> anyhow::Result<HandlerOutcome> {
        let control_id = instruction
            .parameter_value("controlId")
            .ok_or_else(|| anyhow::anyhow!("missing controlId"))?;
        let value = instruction
            .parameter_value("value")
            .ok_or_else(|| anyhow::anyhow!("missing value"))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let write = Instruction::new(id, "ControlWrite", LOCAL_INSTRUCTOR_ID, Utc::now())
            .with_parameter(control_id, value);
        self.writes.lock().push(write);
        Ok(HandlerOutcome::completed())
    }
}

fn toggle(id: i64, value: &str) -> Instruction {
    Instruction::new(id, TOPIC_SET_CONTROL_PARAMETER, "remote", Utc::now())
        .with_parameter("controlId", "/test/toggle")
        .with_parameter("value", value)
}

fn reactor_with(handler: Arc<dyn InstructionHandler>) -> InstructionReactor {
    let store = Arc::new(InstructionStore::open_in_memory().unwrap());
    InstructionReactor::new(store, Dispatcher::new().with_handler(handler))
}

#[test]
fn test_set_control_parameter_scenario() {
    init_tracing();
    let handler = Arc::new(ControlToggleHandler::default());
    let reactor = reactor_with(handler.clone());

    let first = reactor.submit(toggle(1, "false")).unwrap();
    assert_eq!(first.state, InstructionState::Completed);
    let second = reactor.submit(toggle(2, "true")).unwrap();
    assert_eq!(second.state, InstructionState::Completed);

    let writes = handler.writes.lock();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].parameter_value("/test/toggle"), Some("false"));
    assert_eq!(writes[1].parameter_value("/test/toggle"), Some("true"));
}

#[test]
fn test_missing_parameter_is_declined_not_propagated() {
    let handler = Arc::new(ControlToggleHandler::default());
    let reactor = reactor_with(handler.clone());

    let bare = Instruction::new(1, TOPIC_SET_CONTROL_PARAMETER, "remote", Utc::now());
    let status = reactor.submit(bare).unwrap();
    assert_eq!(status.state, InstructionState::Declined);
    assert!(status.message().unwrap().contains("missing controlId"));
    assert!(handler.writes.lock().is_empty());
}

#[test]
fn test_wire_payload_to_acknowledgment() {
    let handler = Arc::new(ControlToggleHandler::default());
    let reactor = reactor_with(handler.clone());

    let payload = r#"[
        {"topic": "SetControlParameter", "id": 11, "instructionDate": "2024-03-01T10:00:00Z",
         "parameters": [{"name": "controlId", "value": "/test/toggle"}, {"name": "value", "value": "true"}]},
        {"topic": "Reboot", "id": 12, "instructionDate": 1709287200000}
    ]"#;
    let instructions = decode_instructions(payload, "remote").unwrap();
    assert_eq!(instructions.len(), 2);

    let mut unhandled = Vec::new();
    for instruction in instructions {
        match reactor.submit(instruction) {
            Ok(status) => assert_eq!(status.state, InstructionState::Completed),
            Err(ReactorError::Unhandled { instruction_id, .. }) => unhandled.push(instruction_id),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(unhandled, vec![InstructionId(12)]);

    let pending = reactor.pending_acknowledgments().unwrap();
    assert_eq!(pending.len(), 2);
    let ack_payload = encode_status(&pending).unwrap();
    let value: serde_json::Value = serde_json::from_str(&ack_payload).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 2);

    for status in &pending {
        reactor
            .acknowledge(status.instruction_id, "remote", status.state)
            .unwrap();
    }
    assert!(reactor.pending_acknowledgments().unwrap().is_empty());
    let completed = reactor.status(InstructionId(11), "remote").unwrap().unwrap();
    assert_eq!(completed.acknowledged_state, Some(InstructionState::Completed));
}

#[test]
fn test_resubmit_after_restart_does_not_repeat_side_effects() {
    let path = temp_db_path("fieldlink_instr");
    let handler = Arc::new(ControlToggleHandler::default());

    let first = {
        let store = Arc::new(InstructionStore::open(&path).unwrap());
        let reactor = InstructionReactor::new(store, Dispatcher::new().with_handler(handler.clone()));
        reactor.submit(toggle(7, "false")).unwrap()
    };

    let store = Arc::new(InstructionStore::open(&path).unwrap());
    let reactor = InstructionReactor::new(store, Dispatcher::new().with_handler(handler.clone()));
    let again = reactor.submit(toggle(7, "false")).unwrap();

    assert_eq!(again, first);
    assert_eq!(handler.writes.lock().len(), 1);
    remove_db(&path);
}

#[test]
fn test_cancel_pending_then_job_has_nothing_to_run() {
    let store = Arc::new(InstructionStore::open_in_memory().unwrap());
    let dispatcher = Dispatcher::new()
        .with_handler(Arc::new(CancelInstructionHandler::new(store.clone())));
    let reactor = Arc::new(InstructionReactor::new(store.clone(), dispatcher));

    let err = reactor
        .submit(Instruction::new(1, "Curtail", "remote", Utc::now()))
        .unwrap_err();
    let core: fieldlink_core::Error = err.into();
    assert!(core.is_retryable());

    let cancel = Instruction::new(2, TOPIC_CANCEL_INSTRUCTION, "remote", Utc::now())
        .with_parameter("id", "1");
    assert_eq!(reactor.submit(cancel).unwrap().state, InstructionState::Completed);

    let job = InstructionExecutionJob::from_config(reactor.clone(), &ReactorConfig::default());
    let summary = job.execute().unwrap();
    assert_eq!(summary.executed + summary.unhandled + summary.expired, 0);
    assert_eq!(
        reactor.status(InstructionId(1), "remote").unwrap().unwrap().state,
        InstructionState::Declined
    );
}

/// Answers a fixed reply for one service name
struct ServiceReply(&'static str);

impl InstructionHandler for ServiceReply {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == self.0
    }

    fn process_instruction(&self, _instruction: &Instruction) -> anyhow::Result<HandlerOutcome> {
        Ok(HandlerOutcome::reply(InstructionState::Completed, 200, self.0))
    }
}

#[test]
fn test_composite_service_dispatch() {
    let services = Dispatcher::new()
        .with_handler(Arc::new(ServiceReply("ping")))
        .with_handler(Arc::new(ServiceReply("restart")));
    let reactor = reactor_with(Arc::new(CompositeHandler::new("SystemConfigure", services)));

    let ping = Instruction::new(1, "SystemConfigure", "remote", Utc::now()).with_parameter("service", "ping");
    let status = reactor.submit(ping).unwrap();
    assert_eq!(status.state, InstructionState::Completed);
    assert_eq!(status.message(), Some("ping"));

    let unknown = Instruction::new(2, "SystemConfigure", "remote", Utc::now()).with_parameter("service", "format");
    let status = reactor.submit(unknown).unwrap();
    assert_eq!(status.state, InstructionState::Declined);
    assert_eq!(status.result_parameters.get("statusCode").map(String::as_str), Some("404"));
}

/// Returns whatever state it is told to
struct Arbitrary(Mutex<Vec<InstructionState>>);

impl InstructionHandler for Arbitrary {
    fn handles_topic(&self, _topic: &str) -> bool {
        true
    }

    fn process_instruction(&self, _instruction: &Instruction) -> anyhow::Result<HandlerOutcome> {
        let state = self.0.lock().pop().unwrap_or(InstructionState::Completed);
        Ok(HandlerOutcome::State(state))
    }
}

fn any_state() -> impl Strategy<Value = InstructionState> {
    prop_oneof![
        Just(InstructionState::Received),
        Just(InstructionState::Executing),
        Just(InstructionState::Declined),
        Just(InstructionState::Completed),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_submitted_states_stay_on_lifecycle_edges(outcomes in proptest::collection::vec(any_state(), 1..12)) {
        let script: Vec<InstructionState> = outcomes.iter().rev().copied().collect();
        let reactor = reactor_with(Arc::new(Arbitrary(Mutex::new(script))));

        for (idx, _) in outcomes.iter().enumerate() {
            let status = reactor
                .submit(Instruction::new(idx as i64 + 1, "Any", "remote", Utc::now()))
                .unwrap();
            prop_assert!(
                InstructionState::Executing == status.state
                    || InstructionState::Executing.can_transition_to(status.state)
            );

            // Resubmitting never moves the state.
            let again = reactor
                .submit(Instruction::new(idx as i64 + 1, "Any", "remote", Utc::now()))
                .unwrap();
            prop_assert_eq!(again.state, status.state);
        }
    }
}
