//! Creation and extraction of the 29-bit SAE J1939 CAN identifiers used by the
//! transport protocol (TP.CM / TP.DT and the messages they carry).
use crate::error::CanIdBuildError;
use crate::protocol::transport::MAX_PGN;

/// Extended-frame flag set by Linux SocketCAN (and most raw drivers) on 29-bit ids.
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Mask keeping the 29 identifier bits.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

//==================================================================================CAN_ID
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Encapsulates an extended CAN identifier (29 bits) and exposes accessors
/// for priority, PGN, destination, and source.
pub struct CanId(pub u32);

impl CanId {
    /// Creates a pre-configured `CanIdBuilder` for a PGN and source address.
    pub fn builder(pgn: u32, source_address: u8) -> CanIdBuilder {
        CanIdBuilder::new(pgn, source_address)
    }

    /// Imports a raw driver identifier, dropping the extended-frame flag and
    /// any bit above the 29-bit range.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw & CAN_EFF_MASK)
    }

    /// Raw identifier with the extended-frame flag set, as written to a raw
    /// CAN socket.
    pub fn to_raw_eff(&self) -> u32 {
        (self.0 & CAN_EFF_MASK) | CAN_EFF_FLAG
    }

    /// Returns the priority (3 bits, value 0-7) encoded in the CAN ID.
    pub fn priority(&self) -> u8 {
        ((self.0 >> 26) & 0x07) as u8
    }

    /// Data page bit.
    pub fn data_page(&self) -> u8 {
        ((self.0 >> 24) & 0x01) as u8
    }

    /// PDU format byte (PF).
    pub fn pdu_format(&self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    /// PDU specific byte (PS): destination for PDU1, group extension for PDU2.
    pub fn pdu_specific(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    /// `true` when PF < 240, i.e. the identifier carries a destination address.
    pub fn is_pdu1(&self) -> bool {
        self.pdu_format() < 240
    }

    /// Extracts the 18-bit PGN, handling the PDU1/PDU2 distinction.
    pub fn pgn(&self) -> u32 {
        let ps = self.pdu_specific() as u32;
        let pf = self.pdu_format() as u32;
        let dp = (self.0 >> 24) & 0x01;
        let r = (self.0 >> 25) & 0x01;

        if self.is_pdu1() {
            // PDU1: PS stores the explicit destination.
            (r << 17) | (dp << 16) | (pf << 8)
        } else {
            // PDU2: implicit destination, PS becomes part of the PGN.
            (r << 17) | (dp << 16) | (pf << 8) | ps
        }
    }

    /// Returns the destination address (PDU1) when the PGN requires one.
    pub fn destination(&self) -> Option<u8> {
        if self.is_pdu1() {
            Some(self.pdu_specific())
        } else {
            None
        }
    }

    /// Eight-bit source address.
    pub fn source_address(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

//==================================================================================CAN_ID_BUILDER
#[derive(Debug)]
/// Fluent builder that enforces the PDU1/PDU2 rules.
pub struct CanIdBuilder {
    pub priority: u8,
    pub pgn: u32,
    pub source_address: u8,
    pub destination: Option<u8>,
}

impl CanIdBuilder {
    /// Initializes the builder for a given PGN and source address.
    pub fn new(pgn: u32, source_address: u8) -> Self {
        Self {
            priority: 7, // Transport protocol default
            pgn,
            source_address,
            destination: None,
        }
    }

    /// Sets the priority (3 bits) to use during construction.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority & 0x07;
        self
    }

    /// Assigns a destination address (PDU1). Implies a directed message;
    /// `0xFF` addresses every node.
    pub fn to_destination(mut self, destination_address: u8) -> Self {
        self.destination = Some(destination_address);
        self
    }

    /// Builds the CAN identifier while applying J1939 rules:
    /// - PF < 240 → addressed message (PDU1): `destination` mandatory and PGN PS byte must be `0`
    /// - PF ≥ 240 → broadcast (PDU2): `destination` must not be provided
    /// - R/DP/PF/PS bits are copied from the provided PGN
    pub fn build(self) -> Result<CanId, CanIdBuildError> {
        if self.pgn > MAX_PGN {
            return Err(CanIdBuildError::InvalidData);
        }
        let r_from_pgn = (self.pgn >> 17) & 0x01;
        let dp_from_pgn = (self.pgn >> 16) & 0x01;
        let pf_from_pgn = ((self.pgn >> 8) & 0xFF) as u8;
        let ps_from_pgn = (self.pgn & 0xFF) as u8;

        let ps = match self.destination {
            None => {
                if pf_from_pgn < 240 {
                    return Err(CanIdBuildError::InvalidForBroadcast);
                }
                ps_from_pgn
            }
            Some(da) => {
                if pf_from_pgn >= 240 {
                    return Err(CanIdBuildError::InvalidForFocusedMessage { pgn: pf_from_pgn });
                }
                if ps_from_pgn != 0 {
                    return Err(CanIdBuildError::PsFocusMessageMustBeNull);
                }
                da
            }
        };

        let id = ((self.priority as u32) << 26)
            | (r_from_pgn << 25)
            | (dp_from_pgn << 24)
            | ((pf_from_pgn as u32) << 16)
            | ((ps as u32) << 8)
            | (self.source_address as u32);
        Ok(CanId(id))
    }
}
