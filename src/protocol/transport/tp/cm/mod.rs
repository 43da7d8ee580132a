//! TP.CM codec: the five connection-management messages exchanged on PGN
//! 0xEC00. Every message is eight bytes; the last three always carry the PGN
//! of the multi-packet message the control message refers to.
use crate::error::CmDecodeError;

pub const CONTROL_RTS: u8 = 0x10;
pub const CONTROL_CTS: u8 = 0x11;
pub const CONTROL_EOM_ACK: u8 = 0x13;
pub const CONTROL_BAM: u8 = 0x20;
pub const CONTROL_ABORT: u8 = 0xFF;

/// RTS "maximum packets per CTS" value meaning the sender sets no limit.
pub const NO_PACKET_LIMIT: u8 = 0xFF;

//==================================================================================ABORT_REASON
/// Connection abort reasons (J1939-21). Values are transmitted as-is; locally
/// they only drive logging and the error returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AbortReason {
    /// Already in one or more connection-managed sessions.
    Busy,
    /// System resources were needed for another task.
    Resources,
    /// A timeout occurred.
    Timeout,
    /// CTS received while a data transfer was in progress.
    CtsWhileSending,
    /// Maximum retransmit request limit reached.
    MaxRetransmit,
    /// Unexpected data transfer packet.
    UnexpectedData,
    /// Bad sequence number.
    SequenceError,
    /// Duplicate sequence number.
    DuplicateSequence,
    /// Total message size above 1785 bytes.
    MessageTooLarge,
    /// Any other code, kept verbatim.
    Other(u8),
}

impl AbortReason {
    /// Wire value.
    pub fn code(&self) -> u8 {
        match self {
            AbortReason::Busy => 1,
            AbortReason::Resources => 2,
            AbortReason::Timeout => 3,
            AbortReason::CtsWhileSending => 4,
            AbortReason::MaxRetransmit => 5,
            AbortReason::UnexpectedData => 6,
            AbortReason::SequenceError => 7,
            AbortReason::DuplicateSequence => 8,
            AbortReason::MessageTooLarge => 9,
            AbortReason::Other(code) => *code,
        }
    }
}

impl From<u8> for AbortReason {
    fn from(code: u8) -> Self {
        match code {
            1 => AbortReason::Busy,
            2 => AbortReason::Resources,
            3 => AbortReason::Timeout,
            4 => AbortReason::CtsWhileSending,
            5 => AbortReason::MaxRetransmit,
            6 => AbortReason::UnexpectedData,
            7 => AbortReason::SequenceError,
            8 => AbortReason::DuplicateSequence,
            9 => AbortReason::MessageTooLarge,
            other => AbortReason::Other(other),
        }
    }
}

//==================================================================================CONTROL_MESSAGE
/// Decoded TP.CM payload (without the trailing PGN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Request To Send: opens a connection-mode transfer.
    Rts {
        total_len: u16,
        num_packets: u8,
        max_packets_per_cts: u8,
    },
    /// Clear To Send: flow-control window granted by the receiver.
    Cts { num_packets: u8, next_packet: u8 },
    /// End Of Message Acknowledge.
    EndOfMsgAck { total_len: u16, num_packets: u8 },
    /// Broadcast Announce Message.
    Bam { total_len: u16, num_packets: u8 },
    /// Connection Abort.
    Abort(AbortReason),
}

impl ControlMessage {
    /// Control byte identifying the message kind.
    pub fn control_byte(&self) -> u8 {
        match self {
            ControlMessage::Rts { .. } => CONTROL_RTS,
            ControlMessage::Cts { .. } => CONTROL_CTS,
            ControlMessage::EndOfMsgAck { .. } => CONTROL_EOM_ACK,
            ControlMessage::Bam { .. } => CONTROL_BAM,
            ControlMessage::Abort(_) => CONTROL_ABORT,
        }
    }

    /// Serialize into the 8-byte TP.CM payload for the message carrying `pgn`.
    pub fn encode(&self, pgn: u32) -> [u8; 8] {
        let mut data = [0xFF; 8];
        data[0] = self.control_byte();
        match *self {
            ControlMessage::Rts {
                total_len,
                num_packets,
                max_packets_per_cts,
            } => {
                data[1..3].copy_from_slice(&total_len.to_le_bytes());
                data[3] = num_packets;
                data[4] = max_packets_per_cts;
            }
            ControlMessage::Cts {
                num_packets,
                next_packet,
            } => {
                data[1] = num_packets;
                data[2] = next_packet;
            }
            ControlMessage::EndOfMsgAck {
                total_len,
                num_packets,
            }
            | ControlMessage::Bam {
                total_len,
                num_packets,
            } => {
                data[1..3].copy_from_slice(&total_len.to_le_bytes());
                data[3] = num_packets;
            }
            ControlMessage::Abort(reason) => {
                data[1] = reason.code();
            }
        }
        data[5..8].copy_from_slice(&encode_pgn(pgn));
        data
    }

    /// Parse a TP.CM payload, returning the message and the PGN it refers to.
    pub fn decode(data: &[u8]) -> Result<(Self, u32), CmDecodeError> {
        if data.len() < 8 {
            return Err(CmDecodeError::TooShort { len: data.len() });
        }
        let total_len = u16::from_le_bytes([data[1], data[2]]);
        let message = match data[0] {
            CONTROL_RTS => ControlMessage::Rts {
                total_len,
                num_packets: data[3],
                max_packets_per_cts: data[4],
            },
            CONTROL_CTS => ControlMessage::Cts {
                num_packets: data[1],
                next_packet: data[2],
            },
            CONTROL_EOM_ACK => ControlMessage::EndOfMsgAck {
                total_len,
                num_packets: data[3],
            },
            CONTROL_BAM => ControlMessage::Bam {
                total_len,
                num_packets: data[3],
            },
            CONTROL_ABORT => ControlMessage::Abort(AbortReason::from(data[1])),
            other => return Err(CmDecodeError::UnknownControlByte(other)),
        };
        Ok((message, decode_pgn([data[5], data[6], data[7]])))
    }
}

/// PGN as carried in control messages: PS, PF, then data page.
pub fn encode_pgn(pgn: u32) -> [u8; 3] {
    [
        (pgn & 0xFF) as u8,
        ((pgn >> 8) & 0xFF) as u8,
        ((pgn >> 16) & 0x03) as u8,
    ]
}

/// Inverse of [`encode_pgn`].
pub fn decode_pgn(bytes: [u8; 3]) -> u32 {
    (bytes[0] as u32) | ((bytes[1] as u32) << 8) | (((bytes[2] & 0x03) as u32) << 16)
}
