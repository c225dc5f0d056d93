/// Test doubles to simulate the CAN bus, timer, and clock during
/// integration tests.
use korri_isobus::protocol::transport::{
    can_frame::CanFrame,
    traits::{
        can_bus::CanBus, korri_clock::KorriClock, korri_timer::KorriTimer, sinks::MessageSink,
    },
    transport_protocol::ReassembledMessage,
};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

#[derive(Clone)]
#[allow(dead_code)]
/// In-memory CAN bus reproducing the `CanBus` trait behavior.
pub struct MockCanBus {
    tx: mpsc::UnboundedSender<CanFrame>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<CanFrame>>>,
}

#[allow(dead_code)]
impl MockCanBus {
    /// Construct a pair of interconnected buses (DUT ↔ host).
    pub fn create_pair() -> (Self, Self) {
        let (dut_tx, host_rx) = mpsc::unbounded_channel();
        let (host_tx, dut_rx) = mpsc::unbounded_channel();

        let dut_bus = Self {
            tx: dut_tx,
            rx: Arc::new(Mutex::new(dut_rx)),
        };

        let host_bus = Self {
            tx: host_tx,
            rx: Arc::new(Mutex::new(host_rx)),
        };

        (dut_bus, host_bus)
    }
}

impl CanBus for MockCanBus {
    type Error = ();

    async fn send<'a>(&'a mut self, frame: &'a CanFrame) -> Result<(), Self::Error> {
        self.tx.send(frame.clone()).map_err(|_| ())?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<CanFrame, Self::Error> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(())
    }
}

#[allow(dead_code)]
/// Timer based on `tokio::time::sleep` to drive delays in tests.
pub struct MockTimer;

impl KorriTimer for MockTimer {
    async fn delay_ms(&mut self, millis: u32) {
        sleep(Duration::from_millis(millis as u64)).await;
    }
}

#[allow(dead_code)]
/// Monotonic clock backed by `std::time::Instant`.
pub struct InstantClock {
    start: Instant,
}

#[allow(dead_code)]
impl InstantClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl KorriClock for InstantClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(dead_code)]
/// One delivery captured at the message-in seam.
pub struct CapturedMessage {
    pub pgn: u32,
    pub priority: u8,
    pub source_address: u8,
    pub destination_address: Option<u8>,
    pub payload: Vec<u8>,
}

#[allow(dead_code)]
/// Message sink collecting deliveries for later assertions.
pub struct CapturedMessages<'t> {
    pub log: &'t RefCell<Vec<CapturedMessage>>,
}

impl MessageSink for CapturedMessages<'_> {
    fn message_received(&mut self, message: &ReassembledMessage<'_>) {
        self.log.borrow_mut().push(CapturedMessage {
            pgn: message.pgn,
            priority: message.priority,
            source_address: message.source.address(),
            destination_address: message.destination.map(|cf| cf.address()),
            payload: message.payload.to_vec(),
        });
    }
}
