//! J1939 transport layer: CAN frame representations, 29-bit identifier
//! management, the multi-packet transport protocol (TP.CM / TP.DT) and the
//! bus abstraction traits.
//!
//! ## J1939-21 Constants
//!
//! Fixed PGNs, payload limits and the default protocol timers. Every timer can
//! be overridden through [`TpConfig`](tp::config::TpConfig).

pub mod can_frame;
pub mod can_id;
pub mod tp;
pub mod traits;

/// Transport Protocol – Connection Management (RTS, CTS, EOM_ACK, BAM, Abort).
pub const PGN_TP_CM: u32 = 0x00EC00;

/// Transport Protocol – Data Transfer (sequence number + seven payload bytes).
pub const PGN_TP_DT: u32 = 0x00EB00;

/// Highest valid PGN (18 bits: DP, PF and PS).
pub const MAX_PGN: u32 = 0x3_FFFF;

/// Global (broadcast) destination address.
pub const ADDRESS_GLOBAL: u8 = 0xFF;

/// Payload bytes carried by one TP.DT frame.
pub const DT_PAYLOAD_LEN: usize = 7;

/// Smallest payload routed through the transport protocol; anything shorter
/// fits a single frame.
pub const MIN_TP_PAYLOAD: usize = 9;

/// Largest payload: 255 packets of seven bytes.
pub const MAX_TP_PAYLOAD: usize = 1785;

/// Largest packet count representable in one byte.
pub const MAX_TP_PACKETS: u8 = 255;

/// T1 (ms): receiver wait between two DT frames.
pub const TP_T1_MS: u64 = 750;

/// T2 (ms): receiver wait for DT after sending a CTS.
pub const TP_T2_MS: u64 = 1250;

/// T3 (ms): sender wait for CTS or EOM_ACK after RTS or the last DT of a window.
pub const TP_T3_MS: u64 = 1250;

/// T4 (ms): sender wait after a CTS hold (CTS with zero packets).
pub const TP_T4_MS: u64 = 1050;

/// Minimum gap between BAM data frames (ms).
///
/// J1939-21 mandates 50 to 200 ms between the BAM announce and the first
/// DT, and between consecutive DT frames of a broadcast transfer.
pub const BAM_MIN_INTER_PACKET_DELAY_MS: u64 = 50;

/// Maximum gap between BAM data frames (ms).
pub const BAM_MAX_INTER_PACKET_DELAY_MS: u64 = 200;

/// Default priority for TP.DT frames and CM replies.
pub const TP_DEFAULT_PRIORITY: u8 = 7;

/// Number of TP.DT packets needed for `total_len` bytes.
pub const fn packet_count(total_len: usize) -> usize {
    total_len.div_ceil(DT_PAYLOAD_LEN)
}
