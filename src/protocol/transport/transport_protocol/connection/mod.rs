//! Wire format of the connection management frames (TP.CM).
//!
//! Every TP.CM frame is eight bytes: byte 0 is a multiplexor selecting the
//! command, bytes 5..8 carry the PGN of the transported message in
//! little-endian order, and bytes 1..5 are command specific (unused
//! positions are padded with `0xFF`).

/// Multiplexor of the Request To Send command.
pub const REQUEST_TO_SEND_MULTIPLEXOR: u8 = 0x10;
/// Multiplexor of the Clear To Send command.
pub const CLEAR_TO_SEND_MULTIPLEXOR: u8 = 0x11;
/// Multiplexor of the End Of Message Acknowledge command.
pub const END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR: u8 = 0x13;
/// Multiplexor of the Broadcast Announce Message command.
pub const BROADCAST_ANNOUNCE_MESSAGE_MULTIPLEXOR: u8 = 0x20;
/// Multiplexor of the Connection Abort command.
pub const CONNECTION_ABORT_MULTIPLEXOR: u8 = 0xFF;

//==================================================================================Abort reasons

/// Reason codes carried by a Connection Abort frame.
///
/// The wire values are fixed by J1939-21; unknown inbound codes collapse to
/// [`ConnectionAbortReason::AnyOtherError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionAbortReason {
    /// Node is already engaged in a connection mode session with this peer.
    AlreadyInCMSession,
    /// Resources were freed for a higher priority task.
    SystemResourcesNeededForAnotherTask,
    /// A protocol timer (T1..T4/Tr) expired.
    Timeout,
    /// A CTS arrived while a data transfer was already in progress.
    ClearToSendReceivedWhileTransferInProgress,
    /// The retransmit request limit was exceeded.
    MaximumRetransmitRequestLimitReached,
    /// A data transfer frame arrived outside an open receive window.
    UnexpectedDataTransferPacketReceived,
    /// A sequence number outside the expected progression.
    BadSequenceNumber,
    /// The same sequence number was received twice.
    DuplicateSequenceNumber,
    /// Catch-all for any other condition.
    AnyOtherError,
}

impl ConnectionAbortReason {
    /// One-byte wire code of the reason.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::AlreadyInCMSession => 1,
            Self::SystemResourcesNeededForAnotherTask => 2,
            Self::Timeout => 3,
            Self::ClearToSendReceivedWhileTransferInProgress => 4,
            Self::MaximumRetransmitRequestLimitReached => 5,
            Self::UnexpectedDataTransferPacketReceived => 6,
            Self::BadSequenceNumber => 7,
            Self::DuplicateSequenceNumber => 8,
            Self::AnyOtherError => 250,
        }
    }

    /// Decode a wire code, folding unknown values into `AnyOtherError`.
    pub fn from_wire(code: u8) -> Self {
        match code {
            1 => Self::AlreadyInCMSession,
            2 => Self::SystemResourcesNeededForAnotherTask,
            3 => Self::Timeout,
            4 => Self::ClearToSendReceivedWhileTransferInProgress,
            5 => Self::MaximumRetransmitRequestLimitReached,
            6 => Self::UnexpectedDataTransferPacketReceived,
            7 => Self::BadSequenceNumber,
            8 => Self::DuplicateSequenceNumber,
            _ => Self::AnyOtherError,
        }
    }
}

//==================================================================================Commands

/// A decoded connection management frame, tagged by its multiplexor byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionManagement {
    /// Opens a destination-specific session (mux 0x10).
    RequestToSend {
        /// Announced message size in bytes.
        total_size: u16,
        /// Announced packet count.
        total_packets: u8,
        /// Largest CTS window the sender is willing to serve.
        packet_limit: u8,
        /// PGN of the transported message.
        pgn: u32,
    },
    /// Grants the sender a window of data frames (mux 0x11). A window of
    /// zero packets asks the sender to hold and keep the connection open.
    ClearToSend {
        /// Number of packets the sender may emit.
        packets_to_send: u8,
        /// Sequence number the window starts at.
        next_packet_number: u8,
        /// PGN of the transported message.
        pgn: u32,
    },
    /// Confirms complete reception of a destination-specific transfer
    /// (mux 0x13).
    EndOfMessageAcknowledge {
        /// Echoed message size.
        total_size: u16,
        /// Echoed packet count.
        total_packets: u8,
        /// PGN of the transported message.
        pgn: u32,
    },
    /// Opens an unacknowledged broadcast session (mux 0x20).
    BroadcastAnnounce {
        /// Announced message size in bytes.
        total_size: u16,
        /// Announced packet count.
        total_packets: u8,
        /// PGN of the transported message.
        pgn: u32,
    },
    /// Tears a connection mode session down (mux 0xFF).
    Abort {
        /// Why the session is being torn down.
        reason: ConnectionAbortReason,
        /// PGN of the transported message.
        pgn: u32,
    },
}

impl ConnectionManagement {
    /// Decode an 8-byte TP.CM payload. Returns `None` for reserved
    /// multiplexor values.
    pub fn decode(data: &[u8; 8]) -> Option<Self> {
        let pgn = u32::from_le_bytes([data[5], data[6], data[7], 0]);
        match data[0] {
            REQUEST_TO_SEND_MULTIPLEXOR => Some(Self::RequestToSend {
                total_size: u16::from_le_bytes([data[1], data[2]]),
                total_packets: data[3],
                packet_limit: data[4],
                pgn,
            }),
            CLEAR_TO_SEND_MULTIPLEXOR => Some(Self::ClearToSend {
                packets_to_send: data[1],
                next_packet_number: data[2],
                pgn,
            }),
            END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR => Some(Self::EndOfMessageAcknowledge {
                total_size: u16::from_le_bytes([data[1], data[2]]),
                total_packets: data[3],
                pgn,
            }),
            BROADCAST_ANNOUNCE_MESSAGE_MULTIPLEXOR => Some(Self::BroadcastAnnounce {
                total_size: u16::from_le_bytes([data[1], data[2]]),
                total_packets: data[3],
                pgn,
            }),
            CONNECTION_ABORT_MULTIPLEXOR => Some(Self::Abort {
                reason: ConnectionAbortReason::from_wire(data[1]),
                pgn,
            }),
            _ => None,
        }
    }

    /// Encode the command into an 8-byte TP.CM payload.
    pub fn encode(&self) -> [u8; 8] {
        let mut buffer = [0xFFu8; 8];
        match *self {
            Self::RequestToSend {
                total_size,
                total_packets,
                packet_limit,
                pgn,
            } => {
                buffer[0] = REQUEST_TO_SEND_MULTIPLEXOR;
                buffer[1..3].copy_from_slice(&total_size.to_le_bytes());
                buffer[3] = total_packets;
                buffer[4] = packet_limit;
                Self::encode_pgn(&mut buffer, pgn);
            }
            Self::ClearToSend {
                packets_to_send,
                next_packet_number,
                pgn,
            } => {
                buffer[0] = CLEAR_TO_SEND_MULTIPLEXOR;
                buffer[1] = packets_to_send;
                buffer[2] = next_packet_number;
                Self::encode_pgn(&mut buffer, pgn);
            }
            Self::EndOfMessageAcknowledge {
                total_size,
                total_packets,
                pgn,
            } => {
                buffer[0] = END_OF_MESSAGE_ACKNOWLEDGE_MULTIPLEXOR;
                buffer[1..3].copy_from_slice(&total_size.to_le_bytes());
                buffer[3] = total_packets;
                Self::encode_pgn(&mut buffer, pgn);
            }
            Self::BroadcastAnnounce {
                total_size,
                total_packets,
                pgn,
            } => {
                buffer[0] = BROADCAST_ANNOUNCE_MESSAGE_MULTIPLEXOR;
                buffer[1..3].copy_from_slice(&total_size.to_le_bytes());
                buffer[3] = total_packets;
                Self::encode_pgn(&mut buffer, pgn);
            }
            Self::Abort { reason, pgn } => {
                buffer[0] = CONNECTION_ABORT_MULTIPLEXOR;
                buffer[1] = reason.to_wire();
                Self::encode_pgn(&mut buffer, pgn);
            }
        }
        buffer
    }

    fn encode_pgn(buffer: &mut [u8; 8], pgn: u32) {
        let bytes = pgn.to_le_bytes();
        buffer[5..8].copy_from_slice(&bytes[0..3]);
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
