//! Abstraction traits used by the transport layer (CAN bus, timer, clock,
//! and the frame/message seams of the protocol core).
pub mod can_bus;
pub mod korri_clock;
pub mod korri_timer;
pub mod sinks;
