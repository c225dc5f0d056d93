//! ISO 11783 transport layer: CAN frame representations, 29-bit identifier
//! management, the multi-packet transport protocol, and bus abstraction
//! traits.
//!
//! ## Transport Protocol Timing Constants
//!
//! These constants are the wire-visible timeouts of ISO 11783-3 / SAE
//! J1939-21 and govern when a stalled session is torn down.

pub mod can_frame;
pub mod can_id;
pub mod supervisor;
pub mod traits;
pub mod transport_protocol;

/// T1: maximum silence between two data frames of a broadcast (BAM) receive
/// session (ms).
///
/// BAM transfers carry no flow control, so the receiver's only defence
/// against a vanished sender is this inactivity window. A broadcast receive
/// session that has not seen a data frame for this long is dropped silently;
/// there is no peer to abort with.
pub const T1_TIMEOUT_MS: u64 = 750;

/// T2/T3: maximum time a transmitting session waits for the peer's Clear To
/// Send or End Of Message Acknowledge (ms).
///
/// Expiry aborts the session with the `Timeout` reason. The same value
/// covers both waits, matching the J1939-21 connection mode timers.
pub const T2_T3_TIMEOUT_MS: u64 = 1250;

/// Tr: maximum silence tolerated by a destination-specific receive session
/// before it aborts with `Timeout` (ms).
pub const MESSAGE_TR_TIMEOUT_MS: u64 = 1250;

/// Default minimal spacing between two data frames of a broadcast session
/// (ms).
///
/// The standard requires at least 50 ms between BAM data frames so that
/// slow receivers can keep up; the value is configurable through
/// [`transport_protocol::TransportConfig`]. Connection mode sessions are
/// paced by the peer's CTS windows instead and use no inter-frame delay.
pub const DEFAULT_BAM_FRAME_GAP_MS: u32 = 50;
