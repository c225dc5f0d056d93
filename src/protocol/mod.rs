//! High-level components of the ISO 11783 protocol: control function
//! handles and the multi-packet transport layer.
pub mod control_function;
pub mod transport;
