//! Error definitions shared across library modules.
//! Each type models a specific failure scenario (CAN ID construction,
//! transport session admission, and related issues).
use thiserror_no_std::Error;

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors that can occur while building a 29-bit CAN identifier.
pub enum CanIdBuildError {
    /// Attempt to build a broadcast message (PDU2) with PF < 240.
    #[error("Invalid for broadcast message: PF is too low")]
    InvalidForBroadcast,
    /// Attempt to send an addressed message (PDU1) with PF ≥ 240.
    #[error("Invalid for addressed message: PF is too high: {pgn}")]
    InvalidForFocusedMessage { pgn: u8 },
    /// In PDU1 the lower 8 bits of the PGN must remain zero.
    #[error("PDU1 PGNs require PS = 0")]
    PsFocusMessageMustBeNull,
}

//==================================================================================TRANSMIT_ERROR

#[derive(Error, Debug, PartialEq, Eq)]
/// Reasons a multi-packet transmission request is rejected at admission.
pub enum TransmitError {
    /// The payload fits in a single CAN frame; the transport protocol only
    /// carries messages of at least 9 bytes.
    #[error("payload of {length} bytes fits in a single frame")]
    TooShort { length: usize },
    /// The payload exceeds the 1785 byte limit of a 255 packet session.
    #[error("payload of {length} bytes exceeds the transport protocol limit")]
    TooLong { length: usize },
    /// The source control function has no valid address on the network.
    #[error("source control function has no valid address")]
    InvalidSource,
    /// A session is already active for this source/destination pair.
    #[error("a session is already active for this source and destination")]
    DuplicateSession,
    /// The configured concurrent session limit is reached.
    #[error("maximum number of concurrent transport sessions reached")]
    SessionLimitReached,
}
