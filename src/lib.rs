//! `korri-isobus` library: the ISO 11783 / SAE J1939 multi-packet transport
//! protocol (TP.CM / TP.DT) for `no_std` environments. The crate exposes the
//! CAN identifier plumbing, the synchronous tick-driven transport protocol
//! manager (BAM broadcasts and RTS/CTS/EOMA connection mode sessions), and an
//! asynchronous supervisor that wires the manager to a CAN bus.
#![no_std]
//==================================================================================
#[cfg(test)]
extern crate std;
//==================================================================================
/// Domain errors (CAN identifier construction, transport session admission).
pub mod error;
/// ISOBUS protocol implementation: control function handles and the
/// multi-packet transport layer.
pub mod protocol;
//==================================================================================
