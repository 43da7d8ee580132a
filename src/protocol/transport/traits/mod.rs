//! Abstraction traits used by the transport layer (CAN bus, clock, and the
//! standalone multi-packet sender).
pub mod bus_clock;
pub mod can_bus;
pub mod tp_sender;
