//! Handlers and polls sharing leased hardware channels

use crate::test_utils::{init_tracing, WireCapture};
use chrono::Utc;
use fieldlink_core::ArbiterConfig;
use fieldlink_arbiter::{
    ArbiterError, ChannelAddress, ConnectionArbiter, RelayBoard, RelayCommand,
};
use fieldlink_queue::{Datum, DatumSamples, DurableDatumQueue};
use fieldlink_reactor::instruction::TOPIC_SET_CONTROL_PARAMETER;
use fieldlink_reactor::{
    Dispatcher, HandlerOutcome, Instruction, InstructionHandler, InstructionReactor,
    InstructionState, InstructionStore,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const BOARD_IDENTITY: u8 = 0xA0;
const RELAY_PREFIX: &str = "/relay/";

/// Drives relays named `/relay/<n>` on one serial channel
struct RelayControlHandler {
    arbiter: Arc<ConnectionArbiter<WireCapture>>,
    address: ChannelAddress,
    lease_timeout: Duration,
}

impl InstructionHandler for RelayControlHandler {
    fn handles_topic(&self, topic: &str) -> bool {
        topic == TOPIC_SET_CONTROL_PARAMETER
    }

    fn process_instruction(&self, instruction: &Instruction) -> anyhow::Result<HandlerOutcome> {
        let board = RelayBoard::new(self.arbiter.as_ref(), self.address.clone(), self.lease_timeout);
        let mut handled = false;
        for param in instruction.parameters() {
            let Some(relay) = param.name.strip_prefix(RELAY_PREFIX) else {
                continue;
            };
            let relay: u8 = relay.parse()?;
            let open: bool = param.value.parse()?;
            board.set(RelayCommand::new(BOARD_IDENTITY, relay, open))?;
            handled = true;
        }
        if handled {
            Ok(HandlerOutcome::completed())
        } else {
            Ok(HandlerOutcome::reply(InstructionState::Declined, 400, "no relay parameters"))
        }
    }
}

fn setup(lease_timeout: Duration) -> (Arc<ConnectionArbiter<WireCapture>>, WireCapture, InstructionReactor) {
    let capture = WireCapture::default();
    let arbiter = Arc::new(ConnectionArbiter::new(capture.clone()));
    let handler = RelayControlHandler {
        arbiter: arbiter.clone(),
        address: ChannelAddress::new("/dev/ttyRelay"),
        lease_timeout,
    };
    let store = Arc::new(InstructionStore::open_in_memory().unwrap());
    let reactor = InstructionReactor::new(store, Dispatcher::new().with_handler(Arc::new(handler)));
    (arbiter, capture, reactor)
}

fn relay_instruction(id: i64, relay: u8, open: bool) -> Instruction {
    Instruction::new(id, TOPIC_SET_CONTROL_PARAMETER, "remote", Utc::now())
        .with_parameter(format!("{RELAY_PREFIX}{relay}"), open.to_string())
}

#[test]
fn test_relay_instructions_write_exact_frames() {
    init_tracing();
    let (_, capture, reactor) = setup(ArbiterConfig::default().default_timeout());

    assert_eq!(
        reactor.submit(relay_instruction(1, 1, true)).unwrap().state,
        InstructionState::Completed
    );
    assert_eq!(
        reactor.submit(relay_instruction(2, 2, false)).unwrap().state,
        InstructionState::Completed
    );

    assert_eq!(
        *capture.written.lock(),
        vec![0xA0, 0x01, 0x01, 0xA2, 0xA0, 0x02, 0x00, 0xA2]
    );
    assert_eq!(capture.opened.lock().len(), 2);
}

#[test]
fn test_contended_channel_declines_then_recovers() {
    let (arbiter, capture, reactor) = setup(Duration::from_millis(50));
    let address = ChannelAddress::with_unit("/dev/ttyRelay", 4);

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let poller = {
        let arbiter = arbiter.clone();
        thread::spawn(move || {
            arbiter.with_connection(&address, Duration::from_secs(1), |_link| {
                let _ = held_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                Ok::<_, ArbiterError>(())
            })
        })
    };
    held_rx.recv().unwrap();

    let status = reactor.submit(relay_instruction(1, 1, true)).unwrap();
    assert_eq!(status.state, InstructionState::Declined);
    assert!(status.message().unwrap().contains("Could not acquire channel"));
    assert!(capture.written.lock().is_empty());

    release_tx.send(()).unwrap();
    poller.join().unwrap().unwrap();

    let status = reactor.submit(relay_instruction(2, 1, true)).unwrap();
    assert_eq!(status.state, InstructionState::Completed);
    assert_eq!(*capture.written.lock(), vec![0xA0, 0x01, 0x01, 0xA2]);
}

#[test]
fn test_lock_timeout_is_classified() {
    let arbiter = Arc::new(ConnectionArbiter::new(WireCapture::default()));
    let address = ChannelAddress::new("/dev/ttyBus");

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let arbiter = arbiter.clone();
        let address = address.clone();
        thread::spawn(move || {
            arbiter.with_connection(&address, Duration::from_secs(1), |_| {
                let _ = held_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                Ok::<_, ArbiterError>(())
            })
        })
    };
    held_rx.recv().unwrap();

    let err = arbiter
        .with_connection(&address, Duration::from_millis(20), |_| Ok::<_, ArbiterError>(()))
        .unwrap_err();
    let core: fieldlink_core::Error = err.into();
    assert!(core.is_lock_timeout());
    assert!(core.is_retryable());

    release_tx.send(()).unwrap();
    holder.join().unwrap().unwrap();
}

/// Read one sample under a lease; failures produce no sample
fn poll(
    arbiter: &ConnectionArbiter<WireCapture>,
    queue: &DurableDatumQueue,
    source_id: &str,
    address: &ChannelAddress,
    read: impl FnOnce() -> Result<f64, ArbiterError>,
) -> Option<i64> {
    let result = arbiter.with_connection(address, Duration::from_millis(200), |_link| read());
    match result {
        Ok(watts) => {
            let samples = DatumSamples::new().with_instantaneous("watts", watts);
            queue.enqueue(&Datum::new(source_id, Utc::now(), samples)).ok()
        }
        Err(e) => {
            tracing::warn!(source_id, error = %e, "Poll produced no sample");
            None
        }
    }
}

#[test]
fn test_failing_source_does_not_block_others() {
    let arbiter = ConnectionArbiter::new(WireCapture::default());
    let queue = DurableDatumQueue::open_in_memory().unwrap();
    let meter = ChannelAddress::with_unit("/dev/ttyBus", 1);
    let inverter = ChannelAddress::with_unit("/dev/ttyBus", 2);

    let failed = poll(&arbiter, &queue, "Inverter", &inverter, || {
        Err(ArbiterError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no response",
        )))
    });
    let ok = poll(&arbiter, &queue, "Main", &meter, || Ok(1500.0));

    assert!(failed.is_none());
    assert!(ok.is_some());
    assert_eq!(queue.count_pending().unwrap(), 1);
    assert!(arbiter.active_lease(&meter.channel).is_none());
}
