//! TP.DT segmentation: payloads are split into numbered packets of seven
//! bytes (byte 0 = sequence number, 1-based) and rebuilt strictly in order.
use crate::protocol::transport::{packet_count, DT_PAYLOAD_LEN, MAX_TP_PAYLOAD};
use crate::protocol::transport::tp::cm::AbortReason;

/// Padding for unused bytes of the final packet.
pub const DT_PADDING: u8 = 0xFF;

//==================================================================================FRAGMENTER
/// Build the TP.DT payload for packet `seq` (1-based) of `payload`.
///
/// Returns `None` when `seq` is outside `1..=packet_count(payload.len())`.
pub fn segment(payload: &[u8], seq: u8) -> Option<[u8; 8]> {
    let total = packet_count(payload.len());
    if seq == 0 || seq as usize > total {
        return None;
    }
    let start = (seq as usize - 1) * DT_PAYLOAD_LEN;
    let end = (start + DT_PAYLOAD_LEN).min(payload.len());

    let mut data = [DT_PADDING; 8];
    data[0] = seq;
    data[1..1 + (end - start)].copy_from_slice(&payload[start..end]);
    Some(data)
}

/// Lazy iterator over every TP.DT payload of a message.
pub struct Fragmenter<'a> {
    payload: &'a [u8],
    next_seq: usize,
}

impl<'a> Fragmenter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            next_seq: 1,
        }
    }

    /// Number of packets the payload needs.
    pub fn num_packets(&self) -> usize {
        packet_count(self.payload.len())
    }
}

impl Iterator for Fragmenter<'_> {
    type Item = [u8; 8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_seq > self.num_packets() || self.next_seq > u8::MAX as usize {
            return None;
        }
        let data = segment(self.payload, self.next_seq as u8)?;
        self.next_seq += 1;
        Some(data)
    }
}

//==================================================================================REASSEMBLER
/// Result of feeding one packet to the reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtProgress {
    /// Packet stored; more are expected.
    Accepted { seq: u8 },
    /// Final packet stored; the message is complete.
    Complete,
}

/// Receive buffer for one inbound transfer.
#[derive(Debug, Clone)]
pub struct Reassembler {
    buffer: [u8; MAX_TP_PAYLOAD],
    total_len: usize,
    received: usize,
    next_seq: u8,
}

impl Reassembler {
    /// Prepare a buffer for `total_len` bytes (clamped to the protocol maximum).
    pub fn new(total_len: usize) -> Self {
        Self {
            buffer: [0; MAX_TP_PAYLOAD],
            total_len: total_len.min(MAX_TP_PAYLOAD),
            received: 0,
            next_seq: 1,
        }
    }

    /// Sequence number expected next.
    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn num_packets(&self) -> usize {
        packet_count(self.total_len)
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.total_len
    }

    /// Store one TP.DT payload. Out-of-order packets are never buffered:
    /// a packet already stored is a duplicate, anything else a bad sequence.
    pub fn accept(&mut self, data: &[u8; 8]) -> Result<DtProgress, AbortReason> {
        let seq = data[0];
        if self.is_complete() {
            return Err(AbortReason::UnexpectedData);
        }
        if seq != self.next_seq {
            return Err(if seq != 0 && seq < self.next_seq {
                AbortReason::DuplicateSequence
            } else {
                AbortReason::SequenceError
            });
        }

        let offset = (seq as usize - 1) * DT_PAYLOAD_LEN;
        let copy_len = (self.total_len - offset).min(DT_PAYLOAD_LEN);
        self.buffer[offset..offset + copy_len].copy_from_slice(&data[1..1 + copy_len]);
        self.received = offset + copy_len;
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.is_complete() {
            Ok(DtProgress::Complete)
        } else {
            Ok(DtProgress::Accepted { seq })
        }
    }

    /// Bytes stored so far (the whole message once complete).
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.received]
    }
}
