//! The two narrow seams between the transport protocol core and the rest of
//! the stack: one callback out to the CAN layer, one callback up to the
//! application.
use crate::protocol::control_function::ControlFunction;
use crate::protocol::transport::transport_protocol::ReassembledMessage;

/// Outbound seam: enqueue a single 8-byte CAN frame.
///
/// Implementations must be non-blocking; returning `false` signals
/// back-pressure and makes the manager stop emitting for the current tick
/// and retry on the next one.
pub trait FrameSink {
    /// Queue one frame for transmission. `destination = None` addresses the
    /// global (broadcast) destination.
    fn send_frame(
        &mut self,
        pgn: u32,
        data: &[u8; 8],
        source: &ControlFunction,
        destination: Option<&ControlFunction>,
        priority: u8,
    ) -> bool;
}

/// Inbound seam: invoked once per fully reassembled multi-packet message.
pub trait MessageSink {
    /// Hand a completed message to the application layer.
    fn message_received(&mut self, message: &ReassembledMessage<'_>);
}
