//! Error definitions shared across library modules.
//! Each type models a specific failure scenario (CAN ID construction, control
//! message decoding, session resources, configuration, and transfer failures).
use crate::protocol::transport::tp::cm::AbortReason;
use crate::protocol::transport::tp::session::AbortCause;
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors that can occur while building a 29-bit CAN identifier.
pub enum CanIdBuildError {
    /// Provided parameters do not produce a valid identifier.
    #[error("Invalid data")]
    InvalidData,
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

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Failures while decoding a TP.CM payload.
pub enum CmDecodeError {
    /// First byte is not one of RTS, CTS, EOM_ACK, BAM or Abort.
    #[error("Unknown control byte {0:#04X}")]
    UnknownControlByte(u8),
    /// Frame shorter than the eight bytes every control message uses.
    #[error("Control message too short: {len} bytes")]
    TooShort { len: usize },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A session cannot be opened.
pub enum ResourceError {
    /// A session is already active for this address pair and role.
    #[error("Session already active for this address pair")]
    Busy,
    /// Every slot of the session table is in use.
    #[error("No free session slot")]
    NoSessionSlot,
}

impl ResourceError {
    /// Abort reason reported to the peer for this rejection.
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            ResourceError::Busy => AbortReason::Busy,
            ResourceError::NoSessionSlot => AbortReason::Resources,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Rejected transport configuration.
pub enum ConfigError {
    /// BAM pacing must stay within 50..=200 ms.
    #[error("BAM inter-packet delay {millis} ms outside 50..=200 ms")]
    BamDelayOutOfRange { millis: u64 },
    /// A protocol timer is zero.
    #[error("Timer {name} must be non-zero")]
    ZeroTimer { name: &'static str },
    /// The receiver must grant at least one packet per CTS.
    #[error("Receive window must be at least 1")]
    EmptyReceiveWindow,
}

//==================================================================================TP_ERROR
#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// Outcome of a failed multi-packet transfer.
pub enum TpError<E: core::fmt::Debug> {
    /// CAN layer refused or failed to send / receive a frame.
    #[error("CAN bus error: {0:?}")]
    Io(E),
    /// The adapter transmitted fewer bytes than the frame holds.
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    /// The peer violated the protocol; the session was aborted with this reason.
    #[error("Protocol violation: {0:?}")]
    Protocol(AbortReason),
    /// The peer aborted the session.
    #[error("Aborted by peer: {0:?}")]
    PeerAbort(AbortReason),
    /// The session was cancelled locally.
    #[error("Cancelled: {0:?}")]
    Cancelled(AbortReason),
    /// No expected frame arrived before the session deadline.
    #[error("Timeout")]
    Timeout,
    /// The session could not be opened.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// Payload length outside 9..=1785 bytes.
    #[error("Invalid transport payload length {len}")]
    InvalidLength { len: usize },
    /// CAN identifier could not be built.
    #[error(transparent)]
    Build(#[from] CanIdBuildError),
    /// Rejected configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<E: core::fmt::Debug> From<AbortCause> for TpError<E> {
    fn from(cause: AbortCause) -> Self {
        match cause {
            AbortCause::Peer(reason) => TpError::PeerAbort(reason),
            AbortCause::Protocol(reason) => TpError::Protocol(reason),
            AbortCause::Timeout => TpError::Timeout,
            AbortCause::Cancelled(reason) => TpError::Cancelled(reason),
        }
    }
}
