//! J1939 protocol components: CAN identifiers and frames, the bus traits and
//! the multi-packet transport protocol.
pub mod transport;
