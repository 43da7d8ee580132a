//! Transport protocol configuration: timers, BAM pacing, flow control.
use embassy_time::Duration;

use crate::error::ConfigError;
use crate::protocol::transport::{
    BAM_MAX_INTER_PACKET_DELAY_MS, BAM_MIN_INTER_PACKET_DELAY_MS, TP_DEFAULT_PRIORITY, TP_T1_MS,
    TP_T2_MS, TP_T3_MS, TP_T4_MS,
};

/// How a connection-mode sender treats the receiver's CTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CtsPolicy {
    /// Wait for CTS after RTS, honour every window and hold, wait for EOM_ACK.
    #[default]
    Honor,
    /// Send every packet right after RTS and close with a locally emitted
    /// EOM_ACK. Only suitable for a fixed peer that never throttles.
    Ignore,
}

/// Tunables for every session handled by a node.
#[derive(Debug, Clone)]
pub struct TpConfig {
    /// Receiver wait between two data packets.
    pub t1: Duration,
    /// Receiver wait for data after a CTS.
    pub t2: Duration,
    /// Sender wait for CTS / EOM_ACK.
    pub t3: Duration,
    /// Sender wait after a CTS hold.
    pub t4: Duration,
    /// Gap before each BAM data packet.
    pub bam_inter_packet_delay: Duration,
    /// Connection-mode sender flow control.
    pub cts_policy: CtsPolicy,
    /// Most packets granted by one CTS when receiving.
    pub receive_window: u8,
    /// Priority of TP.DT frames and of CTS / EOM_ACK / Abort replies.
    pub control_priority: u8,
}

impl Default for TpConfig {
    /// J1939-21 timers, 50 ms BAM pacing, unlimited receive window.
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(TP_T1_MS),
            t2: Duration::from_millis(TP_T2_MS),
            t3: Duration::from_millis(TP_T3_MS),
            t4: Duration::from_millis(TP_T4_MS),
            bam_inter_packet_delay: Duration::from_millis(BAM_MIN_INTER_PACKET_DELAY_MS),
            cts_policy: CtsPolicy::Honor,
            receive_window: u8::MAX,
            control_priority: TP_DEFAULT_PRIORITY,
        }
    }
}

impl TpConfig {
    /// Reject timers of zero, BAM pacing outside 50..=200 ms and empty windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bam = self.bam_inter_packet_delay.as_millis();
        if !(BAM_MIN_INTER_PACKET_DELAY_MS..=BAM_MAX_INTER_PACKET_DELAY_MS).contains(&bam) {
            return Err(ConfigError::BamDelayOutOfRange { millis: bam });
        }
        for (name, timer) in [("t1", self.t1), ("t2", self.t2), ("t3", self.t3), ("t4", self.t4)] {
            if timer.as_millis() == 0 {
                return Err(ConfigError::ZeroTimer { name });
            }
        }
        if self.receive_window == 0 {
            return Err(ConfigError::EmptyReceiveWindow);
        }
        Ok(())
    }

    /// Builder-style override of the CTS policy.
    pub fn with_cts_policy(mut self, policy: CtsPolicy) -> Self {
        self.cts_policy = policy;
        self
    }
}
