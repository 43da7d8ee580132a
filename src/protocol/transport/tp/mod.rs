//! SAE J1939-21 multi-packet transport: connection mode (RTS/CTS) and
//! broadcast (BAM) transfers of 9 to 1785 bytes.
//!
//! Layers, bottom-up: [`cm`] and [`dt`] encode the wire frames, [`session`]
//! is the per-transfer state machine, [`session_table`] bounds the number of
//! concurrent transfers, [`manager`] routes frames and deadlines without any
//! I/O, and [`node`] drives it all over a [`CanBus`](super::traits::can_bus::CanBus).
use crate::error::CanIdBuildError;
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::can_id::CanId;
use crate::protocol::transport::{PGN_TP_CM, PGN_TP_DT};
use cm::ControlMessage;

pub mod cm;
pub mod config;
pub mod dt;
pub mod manager;
pub mod node;
pub mod session;
pub mod session_table;

/// TP.CM frame from `src` to `dst` about the message carrying `pgn`.
pub fn control_frame(
    src: u8,
    dst: u8,
    pgn: u32,
    message: &ControlMessage,
    priority: u8,
) -> Result<CanFrame, CanIdBuildError> {
    let id = CanId::builder(PGN_TP_CM, src)
        .with_priority(priority)
        .to_destination(dst)
        .build()?;
    Ok(CanFrame::new(id, message.encode(pgn)))
}

/// TP.DT frame from `src` to `dst`.
pub fn data_frame(
    src: u8,
    dst: u8,
    data: [u8; 8],
    priority: u8,
) -> Result<CanFrame, CanIdBuildError> {
    let id = CanId::builder(PGN_TP_DT, src)
        .with_priority(priority)
        .to_destination(dst)
        .build()?;
    Ok(CanFrame::new(id, data))
}
