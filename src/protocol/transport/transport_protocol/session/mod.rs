//! Bookkeeping for one in-flight multi-packet transfer.
use crate::protocol::control_function::ControlFunction;
use crate::protocol::transport::transport_protocol::{
    TransmitCompleteCallback, MAX_TRANSPORT_MESSAGE_LENGTH, PROTOCOL_BYTES_PER_FRAME,
};

//==================================================================================Enums and Structs

/// Whether the local node is the sender or the receiver of the transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// Position of a session inside the transport state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMachineState {
    /// Idle; nothing to drive on the next update.
    None,
    /// A BAM frame is pending emission.
    BroadcastAnnounce,
    /// An RTS frame is pending emission.
    RequestToSend,
    /// RTS sent; waiting for the peer's CTS (T2/T3 guarded).
    WaitForClearToSend,
    /// Data frames are being emitted.
    TxDataSession,
    /// A CTS frame is pending emission for the next receive window.
    ClearToSend,
    /// Data frames are being collected (T1/Tr guarded).
    RxDataSession,
    /// All packets sent; waiting for the peer's EOMA (T2/T3 guarded).
    WaitForEndOfMessageAcknowledge,
}

/// Message buffer owned by a session.
///
/// Fixed capacity with a logical length, so receive sessions can be opened
/// without allocating. The logical length always equals the announced total
/// message size.
#[derive(Debug)]
pub struct SessionData {
    len: usize,
    data: [u8; MAX_TRANSPORT_MESSAGE_LENGTH],
}

impl SessionData {
    /// Buffer pre-filled with a transmit payload. `payload` must respect the
    /// 1785 byte protocol limit; admission validates this before copying.
    pub(crate) fn from_payload(payload: &[u8]) -> Self {
        let mut data = [0xFF; MAX_TRANSPORT_MESSAGE_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Self {
            len: payload.len(),
            data,
        }
    }

    /// Empty buffer expecting `len` bytes of reassembled payload.
    pub(crate) fn with_expected_len(len: usize) -> Self {
        Self {
            len,
            data: [0; MAX_TRANSPORT_MESSAGE_LENGTH],
        }
    }

    /// Announced message size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the buffer holds no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Immutable view over the message bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Mutable view over the message bytes.
    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

//==================================================================================Session

/// One active transfer: direction, state, buffer, counters, and the
/// timestamp of its last progress event.
///
/// The session exclusively owns its data buffer; the control function
/// handles are shared, read-only references into the peer registry.
pub struct TransportProtocolSession<'m> {
    pub(crate) direction: Direction,
    pub(crate) state: StateMachineState,
    pub(crate) pgn: u32,
    pub(crate) source: &'m ControlFunction,
    pub(crate) destination: Option<&'m ControlFunction>,
    pub(crate) data: SessionData,
    pub(crate) total_packets: u8,
    /// Highest sequence number moved so far; global across CTS windows.
    pub(crate) last_packet_number: u8,
    /// Packets moved since the current CTS window opened.
    pub(crate) window_packet_count: u8,
    /// Size of the current CTS window.
    pub(crate) cts_packet_count: u8,
    /// Largest window the peer allows (from its RTS), or 255 for local
    /// transmit sessions where the peer's CTS is authoritative.
    pub(crate) cts_packet_count_max: u8,
    /// Timestamp of the last progress event, from the manager's clock.
    pub(crate) timestamp_ms: u64,
    pub(crate) complete_callback: Option<TransmitCompleteCallback>,
}

impl<'m> TransportProtocolSession<'m> {
    /// Session for an outgoing message; the payload is copied into the
    /// session-owned buffer.
    pub(crate) fn create_transmit_session(
        pgn: u32,
        payload: &[u8],
        source: &'m ControlFunction,
        destination: Option<&'m ControlFunction>,
        complete_callback: Option<TransmitCompleteCallback>,
        now_ms: u64,
    ) -> Self {
        Self {
            direction: Direction::Transmit,
            state: StateMachineState::None,
            pgn,
            source,
            destination,
            data: SessionData::from_payload(payload),
            total_packets: payload.len().div_ceil(PROTOCOL_BYTES_PER_FRAME) as u8,
            last_packet_number: 0,
            window_packet_count: 0,
            cts_packet_count: 0,
            cts_packet_count_max: u8::MAX,
            timestamp_ms: now_ms,
            complete_callback,
        }
    }

    /// Session for an announced incoming message.
    pub(crate) fn create_receive_session(
        pgn: u32,
        total_size: u16,
        total_packets: u8,
        cts_packet_count_max: u8,
        source: &'m ControlFunction,
        destination: Option<&'m ControlFunction>,
        now_ms: u64,
    ) -> Self {
        Self {
            direction: Direction::Receive,
            state: StateMachineState::None,
            pgn,
            source,
            destination,
            data: SessionData::with_expected_len(total_size as usize),
            total_packets,
            last_packet_number: 0,
            window_packet_count: 0,
            cts_packet_count: 0,
            cts_packet_count_max,
            timestamp_ms: now_ms,
            complete_callback: None,
        }
    }

    /// Sessions are keyed by their (source, destination) identity pair,
    /// regardless of PGN.
    pub(crate) fn matches(
        &self,
        source: &ControlFunction,
        destination: Option<&ControlFunction>,
    ) -> bool {
        if !core::ptr::eq(self.source, source) {
            return false;
        }
        match (self.destination, destination) {
            (None, None) => true,
            (Some(ours), Some(theirs)) => core::ptr::eq(ours, theirs),
            _ => false,
        }
    }

    /// Broadcast sessions have the global destination.
    #[inline]
    pub(crate) fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    /// Move to `state` and record the progress event.
    pub(crate) fn set_state(&mut self, state: StateMachineState, now_ms: u64) {
        self.state = state;
        self.timestamp_ms = now_ms;
    }

    /// Announced message size in bytes.
    #[inline]
    pub(crate) fn total_size(&self) -> u16 {
        self.data.len() as u16
    }

    /// Packets not yet moved in this session.
    #[inline]
    pub(crate) fn remaining_packets(&self) -> u8 {
        self.total_packets - self.last_packet_number
    }

    /// Whether every payload byte has been moved.
    #[inline]
    pub(crate) fn is_message_complete(&self) -> bool {
        PROTOCOL_BYTES_PER_FRAME * self.last_packet_number as usize >= self.data.len()
    }
}
