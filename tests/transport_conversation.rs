//! Integration scenarios: two transport supervisors exchange multi-packet
//! messages over a simulated CAN bus.

mod helpers;

// Provides the critical-section implementation embassy-sync needs on a host.
use critical_section as _;

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use helpers::{CapturedMessage, CapturedMessages, InstantClock, MockCanBus, MockTimer};
use korri_isobus::protocol::control_function::{ControlFunction, PeerRegistry};
use korri_isobus::protocol::transport::can_frame::CanFrame;
use korri_isobus::protocol::transport::can_id::CanId;
use korri_isobus::protocol::transport::supervisor::{TransportCommand, TransportSupervisor};
use korri_isobus::protocol::transport::transport_protocol::{
    TransmitResult, TransportConfig, MAX_TRANSPORT_MESSAGE_LENGTH,
};
use tokio::time::{sleep, timeout, Duration};

/// Bundle of the caller-owned shared state one supervisor borrows.
struct Node {
    identity: ControlFunction,
    peers: PeerRegistry<4>,
    out_queue: Channel<CriticalSectionRawMutex, CanFrame, 8>,
    commands: Channel<CriticalSectionRawMutex, TransportCommand, 2>,
    app_frames: Channel<CriticalSectionRawMutex, CanFrame, 4>,
    messages: RefCell<Vec<CapturedMessage>>,
}

impl Node {
    fn new(address: u8) -> Self {
        Self {
            identity: ControlFunction::new(address),
            peers: PeerRegistry::new(),
            out_queue: Channel::new(),
            commands: Channel::new(),
            app_frames: Channel::new(),
            messages: RefCell::new(Vec::new()),
        }
    }

    fn supervisor(
        &self,
        bus: MockCanBus,
    ) -> TransportSupervisor<
        '_,
        MockCanBus,
        MockTimer,
        InstantClock,
        CapturedMessages<'_>,
        4,
        8,
        2,
        4,
    > {
        TransportSupervisor::new(
            bus,
            MockTimer,
            InstantClock::new(),
            CapturedMessages {
                log: &self.messages,
            },
            TransportConfig::default(),
            &self.identity,
            &self.peers,
            &self.out_queue,
            Some(&self.commands),
            Some(&self.app_frames),
        )
    }
}

fn message_payload(length: usize) -> [u8; MAX_TRANSPORT_MESSAGE_LENGTH] {
    let mut payload = [0u8; MAX_TRANSPORT_MESSAGE_LENGTH];
    for (i, byte) in payload.iter_mut().take(length).enumerate() {
        *byte = (i + 1) as u8;
    }
    payload
}

#[tokio::test]
/// A broadcast announced by one node lands once at the other node.
async fn test_broadcast_conversation() {
    let (dut_bus, host_bus) = MockCanBus::create_pair();
    let dut = Node::new(0x01);
    let host = Node::new(0x26);

    dut.commands
        .send(TransportCommand::SendMessage {
            pgn: 0xFEEC,
            destination: None,
            length: 17,
            payload: message_payload(17),
            complete_callback: None,
        })
        .await;

    let wait_for_delivery = async {
        loop {
            sleep(Duration::from_millis(10)).await;
            if !host.messages.borrow().is_empty() {
                break;
            }
        }
    };

    tokio::select! {
        _ = dut.supervisor(dut_bus).run() => panic!("dut supervisor stopped"),
        _ = host.supervisor(host_bus).run() => panic!("host supervisor stopped"),
        result = timeout(Duration::from_secs(3), wait_for_delivery) => {
            result.expect("broadcast must be delivered in time");
        }
    }

    let delivered = host.messages.borrow();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].pgn, 0xFEEC);
    assert_eq!(delivered[0].priority, 6);
    assert_eq!(delivered[0].source_address, 0x01);
    assert_eq!(delivered[0].destination_address, None);
    assert_eq!(delivered[0].payload, (1u8..=17).collect::<Vec<u8>>());
    assert!(dut.messages.borrow().is_empty());
}

#[tokio::test]
/// A destination specific transfer completes the RTS/CTS/EOMA handshake and
/// reports success to the producer's callback.
async fn test_connection_mode_conversation() {
    static CALLBACK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static CALLBACK_SUCCESSES: AtomicUsize = AtomicUsize::new(0);
    fn on_complete(result: &TransmitResult<'_>) {
        CALLBACK_CALLS.fetch_add(1, Ordering::Relaxed);
        if result.successful {
            CALLBACK_SUCCESSES.fetch_add(1, Ordering::Relaxed);
        }
    }

    let (dut_bus, host_bus) = MockCanBus::create_pair();
    let dut = Node::new(0x01);
    let host = Node::new(0x26);

    dut.commands
        .send(TransportCommand::SendMessage {
            pgn: 0xFEEB,
            destination: Some(0x26),
            length: 23,
            payload: message_payload(23),
            complete_callback: Some(on_complete),
        })
        .await;

    let wait_for_completion = async {
        loop {
            sleep(Duration::from_millis(10)).await;
            if !host.messages.borrow().is_empty() && CALLBACK_CALLS.load(Ordering::Relaxed) > 0 {
                break;
            }
        }
    };

    tokio::select! {
        _ = dut.supervisor(dut_bus).run() => panic!("dut supervisor stopped"),
        _ = host.supervisor(host_bus).run() => panic!("host supervisor stopped"),
        result = timeout(Duration::from_secs(3), wait_for_completion) => {
            result.expect("transfer must complete in time");
        }
    }

    let delivered = host.messages.borrow();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].pgn, 0xFEEB);
    assert_eq!(delivered[0].source_address, 0x01);
    assert_eq!(delivered[0].destination_address, Some(0x26));
    assert_eq!(delivered[0].payload, (1u8..=23).collect::<Vec<u8>>());
    assert_eq!(CALLBACK_CALLS.load(Ordering::Relaxed), 1);
    assert_eq!(CALLBACK_SUCCESSES.load(Ordering::Relaxed), 1);
}

#[tokio::test]
/// Non-transport traffic passes straight through to the application frame
/// channel of the other node.
async fn test_single_frame_passthrough() {
    let (dut_bus, host_bus) = MockCanBus::create_pair();
    let dut = Node::new(0x01);
    let host = Node::new(0x26);

    let frame = CanFrame {
        id: CanId::builder(0xFEF1, 0x01)
            .with_priority(6)
            .build()
            .expect("PDU2 identifier must build"),
        data: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
        len: 8,
    };
    dut.commands
        .send(TransportCommand::SendFrame(frame.clone()))
        .await;

    tokio::select! {
        _ = dut.supervisor(dut_bus).run() => panic!("dut supervisor stopped"),
        _ = host.supervisor(host_bus).run() => panic!("host supervisor stopped"),
        result = timeout(Duration::from_secs(3), host.app_frames.receive()) => {
            let forwarded = result.expect("frame must be forwarded in time");
            assert_eq!(forwarded, frame);
        }
    }

    assert!(host.messages.borrow().is_empty());
}
