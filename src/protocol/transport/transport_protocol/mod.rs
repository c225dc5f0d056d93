//! ISO 11783-3 / SAE J1939-21 multi-packet transport protocol (TP).
//!
//! Messages between 9 and 1785 bytes are carried across 8-byte CAN frames on
//! two dedicated PGNs: connection management (TP.CM) and data transfer
//! (TP.DT). Broadcast transfers open with a Broadcast Announce Message and
//! run unacknowledged with time pacing; destination-specific transfers use
//! the Request To Send / Clear To Send / End Of Message Acknowledge
//! handshake with explicit flow control.
use crate::protocol::control_function::ControlFunction;
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::DEFAULT_BAM_FRAME_GAP_MS;

pub mod connection;
pub mod manager;
pub mod session;

//==================================================================================Constants

/// PGN of the connection management frames (TP.CM).
pub const TRANSPORT_CONNECTION_MANAGEMENT_PGN: u32 = 0xEC00;
/// PGN of the data transfer frames (TP.DT).
pub const TRANSPORT_DATA_TRANSFER_PGN: u32 = 0xEB00;

/// Payload bytes carried by each data transfer frame (byte 0 holds the
/// sequence number).
pub const PROTOCOL_BYTES_PER_FRAME: usize = 7;
/// Smallest message worth a transport session; anything shorter fits a
/// single CAN frame.
pub const MIN_TRANSPORT_MESSAGE_LENGTH: usize = 9;
/// Largest message a 255 packet session can carry (255 × 7 bytes).
pub const MAX_TRANSPORT_MESSAGE_LENGTH: usize = 1785;

/// Hard bound on packets per session. The wire format stores the packet
/// count in one byte, so this is not configurable.
pub const MAX_PACKETS_PER_SESSION: u8 = 255;
/// CTS window size we advertise in outgoing Request To Send frames.
pub const MAX_PACKETS_PER_CTS: u8 = 16;

/// Size of the fixed session pool. The runtime limit is
/// [`TransportConfig::max_sessions`], clamped by this bound.
pub const MAX_CONCURRENT_SESSIONS: usize = 8;

//==================================================================================Configuration

/// Tunable limits of the transport protocol manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum number of concurrently active sessions, transmit and receive
    /// combined. Values above [`MAX_CONCURRENT_SESSIONS`] are clamped.
    pub max_sessions: usize,
    /// Minimal spacing between two data frames of a broadcast session (ms).
    pub bam_frame_gap_ms: u32,
    /// Maximum number of connection mode data frames emitted per session in
    /// a single update pass.
    pub frames_per_update: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            bam_frame_gap_ms: DEFAULT_BAM_FRAME_GAP_MS,
            frames_per_update: 255,
        }
    }
}

//==================================================================================Messages

/// An inbound CAN frame whose source and destination have been resolved to
/// shared control function handles.
///
/// `destination = None` marks a frame addressed to the global destination.
#[derive(Debug)]
pub struct AddressedFrame<'m> {
    /// The raw frame as read from the bus.
    pub frame: CanFrame,
    /// Peer the frame originates from.
    pub source: &'m ControlFunction,
    /// Local recipient, or `None` for broadcast traffic.
    pub destination: Option<&'m ControlFunction>,
}

/// A fully reassembled multi-packet message, handed to the
/// [`MessageSink`](crate::protocol::transport::traits::sinks::MessageSink)
/// exactly once per completed receive session.
#[derive(Debug)]
pub struct ReassembledMessage<'m> {
    /// PGN announced in the opening BAM or RTS frame.
    pub pgn: u32,
    /// Messages are presented upward at the default priority (6).
    pub priority: u8,
    /// Transmitting peer.
    pub source: &'m ControlFunction,
    /// Local recipient, or `None` when the transfer was broadcast.
    pub destination: Option<&'m ControlFunction>,
    /// Reassembled payload; its length equals the announced total size.
    pub payload: &'m [u8],
}

/// Outcome of an admitted transmit session, passed to its completion
/// callback exactly once.
#[derive(Debug)]
pub struct TransmitResult<'m> {
    /// PGN of the transmitted message.
    pub pgn: u32,
    /// Total message size in bytes.
    pub length: u16,
    /// Transmitting control function.
    pub source: &'m ControlFunction,
    /// Recipient, or `None` for a broadcast.
    pub destination: Option<&'m ControlFunction>,
    /// `true` when the transfer completed (EOMA received, or every broadcast
    /// data frame emitted); `false` on abort, timeout, or peer abort.
    pub successful: bool,
}

/// Completion callback of a transmit session.
pub type TransmitCompleteCallback = fn(&TransmitResult<'_>);
