//! In-memory representation of an SAE J1939 CAN frame, plus conversions to
//! the `embedded-can` frame types used by HAL drivers.
use crate::protocol::transport::can_id::CanId;
use embedded_can::{ExtendedId, Frame, Id};

#[derive(Clone, Debug, PartialEq, Eq)]
/// Raw J1939 frame as read from the CAN bus.
pub struct CanFrame {
    /// Full 29-bit CAN identifier stored inside a `u32`.
    pub id: CanId,
    /// Payload buffer. Classic CAN frames always provide eight bytes.
    pub data: [u8; 8],
    /// Number of valid payload bytes (Data Length Code, 0 to 8).
    pub len: usize,
}

impl CanFrame {
    /// Full-length frame; every transport protocol frame uses all eight bytes.
    pub fn new(id: CanId, data: [u8; 8]) -> Self {
        Self { id, data, len: 8 }
    }

    /// Valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len.min(8)]
    }

    /// Converts a driver frame. Standard (11-bit) and remote frames are not
    /// J1939 traffic and yield `None`.
    pub fn from_embedded<F: Frame>(frame: &F) -> Option<Self> {
        let raw = match frame.id() {
            Id::Extended(id) => id.as_raw(),
            Id::Standard(_) => return None,
        };
        if frame.is_remote_frame() {
            return None;
        }
        let bytes = frame.data();
        let len = bytes.len().min(8);
        let mut data = [0xFF; 8];
        data[..len].copy_from_slice(&bytes[..len]);
        Some(Self {
            id: CanId::from_raw(raw),
            data,
            len,
        })
    }

    /// Builds the driver frame type for transmission.
    pub fn to_embedded<F: Frame>(&self) -> Option<F> {
        let id = ExtendedId::new(self.id.0 & crate::protocol::transport::can_id::CAN_EFF_MASK)?;
        F::new(id, self.payload())
    }
}
