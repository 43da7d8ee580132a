//! `j1939-tp` library: the SAE J1939-21 transport protocol (TP.CM / TP.DT)
//! for `no_std` targets. Payloads of 9 to 1785 bytes are split into numbered
//! CAN frames and rebuilt on the other side, either peer-to-peer with RTS/CTS
//! flow control or broadcast with BAM.
#![no_std]
//==================================================================================
/// Domain and low-level errors (CAN identifier construction, control message
/// decoding, session resources, configuration and transfer failures).
pub mod error;
/// J1939 protocol implementation: CAN transport and multi-packet sessions.
pub mod protocol;
//==================================================================================
