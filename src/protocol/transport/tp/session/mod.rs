//! Transport session state machine.
//!
//! One [`Session`] tracks one transfer in one direction. Its state is a tagged
//! enum and every change goes through [`Session::handle`], which returns the
//! control message to reply with (if any) and the terminal outcome once the
//! transfer is over. The session never touches the bus or the clock itself:
//! the caller supplies `now` and performs the I/O.
use embassy_time::Instant;
use heapless::Vec;

use crate::error::CanIdBuildError;
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::tp::cm::{AbortReason, ControlMessage, NO_PACKET_LIMIT};
use crate::protocol::transport::tp::config::{CtsPolicy, TpConfig};
use crate::protocol::transport::tp::dt::{segment, DtProgress, Reassembler};
use crate::protocol::transport::tp::{control_frame, data_frame};
use crate::protocol::transport::{packet_count, MAX_TP_PAYLOAD};

//==================================================================================KEYS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Peer-to-peer RTS/CTS transfer.
    Connection,
    /// BAM to the global address, no flow control.
    Broadcast,
}

/// Identity of a session: the transfer's source and destination plus the
/// local role. Only one session per key may be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionKey {
    pub src: u8,
    pub dst: u8,
    pub role: Role,
}

impl SessionKey {
    pub fn sender(src: u8, dst: u8) -> Self {
        Self {
            src,
            dst,
            role: Role::Sender,
        }
    }

    pub fn receiver(src: u8, dst: u8) -> Self {
        Self {
            src,
            dst,
            role: Role::Receiver,
        }
    }

    /// Address this node uses on the wire for the session.
    pub fn local(&self) -> u8 {
        match self.role {
            Role::Sender => self.src,
            Role::Receiver => self.dst,
        }
    }

    /// Address of the other end.
    pub fn peer(&self) -> u8 {
        match self.role {
            Role::Sender => self.dst,
            Role::Receiver => self.src,
        }
    }
}

//==================================================================================STATE
/// Protocol state. `Done` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// Created; nothing sent or granted yet.
    Idle,
    /// Sender: RTS sent, waiting for the first CTS.
    RtsSent,
    /// Sender: window finished or hold requested, waiting for the next CTS.
    AwaitingCts,
    /// Sender: emitting packets `next_seq..=window_end`.
    SendingData { next_seq: u8, window_end: u8 },
    /// Sender: every packet sent, waiting for (or emitting) EOM_ACK.
    AwaitingEom,
    /// Receiver: CTS sent, waiting for packet `next_seq`.
    CtsSent { next_seq: u8, window_end: u8 },
    /// Receiver: packets arriving in order.
    ReceivingData { next_seq: u8, window_end: u8 },
    Done,
    Aborted(AbortReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted(_))
    }
}

/// Inputs of the transition function.
#[derive(Debug, Clone, Copy)]
pub enum SessionEvent<'a> {
    /// Receiver: start the handshake after RTS/BAM was accepted.
    Open,
    /// Sender: the frame returned by [`Session::pending`] went out.
    Transmitted,
    Cts { num_packets: u8, next_packet: u8 },
    EndOfMsgAck,
    Data(&'a [u8; 8]),
    PeerAbort(AbortReason),
    /// The session deadline passed.
    Timeout,
    /// Local cancellation.
    Cancel(AbortReason),
}

/// Why a session ended in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AbortCause {
    /// The peer sent an Abort.
    Peer(AbortReason),
    /// The peer broke the protocol; we aborted with this reason.
    Protocol(AbortReason),
    Timeout,
    Cancelled(AbortReason),
}

impl AbortCause {
    pub fn reason(&self) -> AbortReason {
        match self {
            AbortCause::Peer(reason)
            | AbortCause::Protocol(reason)
            | AbortCause::Cancelled(reason) => *reason,
            AbortCause::Timeout => AbortReason::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Termination {
    Completed,
    Aborted(AbortCause),
}

/// Result of one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    /// Control message to send to the peer.
    pub reply: Option<ControlMessage>,
    /// Set exactly once, on the transition into a terminal state.
    pub termination: Option<Termination>,
}

impl Step {
    fn reply(message: ControlMessage) -> Self {
        Self {
            reply: Some(message),
            termination: None,
        }
    }

    fn completed(reply: Option<ControlMessage>) -> Self {
        Self {
            reply,
            termination: Some(Termination::Completed),
        }
    }
}

/// Frame a sender session wants on the bus now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Control(ControlMessage),
    Data([u8; 8]),
}

#[derive(Debug, Clone)]
enum SessionData {
    Outbound(Vec<u8, MAX_TP_PAYLOAD>),
    Inbound {
        reassembler: Reassembler,
        max_window: u8,
    },
}

//==================================================================================SESSION
/// One in-flight transfer.
#[derive(Debug, Clone)]
pub struct Session {
    key: SessionKey,
    pgn: u32,
    priority: u8,
    mode: Mode,
    total_len: u16,
    num_packets: u8,
    state: SessionState,
    deadline: Option<Instant>,
    next_tx_at: Instant,
    data: SessionData,
}

impl Session {
    /// Outbound transfer of `payload` (expected within 9..=1785 bytes).
    /// A global destination selects BAM.
    pub fn sender(key: SessionKey, pgn: u32, priority: u8, payload: &[u8], now: Instant) -> Self {
        let len = payload.len().min(MAX_TP_PAYLOAD);
        let mut buffer = Vec::new();
        // Cannot overflow: clamped to capacity above.
        let _ = buffer.extend_from_slice(&payload[..len]);
        let mode = if key.dst == crate::protocol::transport::ADDRESS_GLOBAL {
            Mode::Broadcast
        } else {
            Mode::Connection
        };
        Self {
            key,
            pgn,
            priority: priority & 0x07,
            mode,
            total_len: len as u16,
            num_packets: packet_count(len) as u8,
            state: SessionState::Idle,
            deadline: None,
            next_tx_at: now,
            data: SessionData::Outbound(buffer),
        }
    }

    /// Inbound transfer announced by RTS (`Connection`) or BAM (`Broadcast`).
    /// `max_packets_per_cts` is the sender's RTS limit (ignored for BAM).
    #[allow(clippy::too_many_arguments)]
    pub fn receiver(
        key: SessionKey,
        pgn: u32,
        priority: u8,
        mode: Mode,
        total_len: u16,
        max_packets_per_cts: u8,
        config: &TpConfig,
        now: Instant,
    ) -> Self {
        let reassembler = Reassembler::new(total_len as usize);
        Self {
            key,
            pgn,
            priority: priority & 0x07,
            mode,
            total_len,
            num_packets: reassembler.num_packets() as u8,
            state: SessionState::Idle,
            deadline: None,
            next_tx_at: now,
            data: SessionData::Inbound {
                reassembler,
                max_window: config.receive_window.min(max_packets_per_cts).max(1),
            },
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn pgn(&self) -> u32 {
        self.pgn
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn total_len(&self) -> u16 {
        self.total_len
    }

    pub fn num_packets(&self) -> u8 {
        self.num_packets
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the current wait has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.state.is_terminal() && self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Reassembled bytes; the full message once a receiver reached `Done`.
    pub fn received_payload(&self) -> Option<&[u8]> {
        match &self.data {
            SessionData::Inbound { reassembler, .. } => Some(reassembler.payload()),
            SessionData::Outbound(_) => None,
        }
    }

    /// Earliest instant at which the session needs attention again.
    pub fn next_wake(&self, config: &TpConfig) -> Option<Instant> {
        let tx = if self.wants_to_transmit(config) {
            Some(self.next_tx_at)
        } else {
            None
        };
        match (tx, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn wants_to_transmit(&self, config: &TpConfig) -> bool {
        if self.key.role != Role::Sender {
            return false;
        }
        match self.state {
            SessionState::Idle | SessionState::SendingData { .. } => true,
            SessionState::AwaitingEom => {
                self.mode == Mode::Connection && config.cts_policy == CtsPolicy::Ignore
            }
            _ => false,
        }
    }

    /// Frame due on the bus at `now`, if any. Calling this does not change
    /// the state; report the write with [`SessionEvent::Transmitted`].
    pub fn pending(&self, now: Instant, config: &TpConfig) -> Option<Outbound> {
        if !self.wants_to_transmit(config) || now < self.next_tx_at {
            return None;
        }
        match (self.state, &self.data) {
            (SessionState::Idle, _) => Some(Outbound::Control(match self.mode {
                Mode::Connection => ControlMessage::Rts {
                    total_len: self.total_len,
                    num_packets: self.num_packets,
                    max_packets_per_cts: NO_PACKET_LIMIT,
                },
                Mode::Broadcast => ControlMessage::Bam {
                    total_len: self.total_len,
                    num_packets: self.num_packets,
                },
            })),
            (SessionState::SendingData { next_seq, .. }, SessionData::Outbound(payload)) => {
                segment(payload, next_seq).map(Outbound::Data)
            }
            (SessionState::AwaitingEom, _) => Some(Outbound::Control(self.end_of_msg_ack())),
            _ => None,
        }
    }

    /// Bus frame for an [`Outbound`] of this sender session. RTS and BAM
    /// carry the message priority, everything else the configured one.
    pub fn frame_for(
        &self,
        outbound: Outbound,
        config: &TpConfig,
    ) -> Result<CanFrame, CanIdBuildError> {
        match outbound {
            Outbound::Control(message) => {
                let priority = match message {
                    ControlMessage::Rts { .. } | ControlMessage::Bam { .. } => self.priority,
                    _ => config.control_priority,
                };
                control_frame(self.key.src, self.key.dst, self.pgn, &message, priority)
            }
            Outbound::Data(data) => {
                data_frame(self.key.src, self.key.dst, data, config.control_priority)
            }
        }
    }

    /// The transition function.
    pub fn handle(&mut self, event: SessionEvent<'_>, now: Instant, config: &TpConfig) -> Step {
        if self.state.is_terminal() {
            return Step::default();
        }
        match event {
            SessionEvent::PeerAbort(reason) => self.abort(AbortCause::Peer(reason), None),
            SessionEvent::Timeout => {
                let notify = self.notify(ControlMessage::Abort(AbortReason::Timeout));
                self.abort(AbortCause::Timeout, notify)
            }
            SessionEvent::Cancel(reason) => {
                let notify = if self.key.role == Role::Sender && self.state == SessionState::Idle
                {
                    // RTS never left: the peer knows nothing about us.
                    None
                } else {
                    self.notify(ControlMessage::Abort(reason))
                };
                self.abort(AbortCause::Cancelled(reason), notify)
            }
            _ => match self.key.role {
                Role::Sender => self.handle_sender(event, now, config),
                Role::Receiver => self.handle_receiver(event, now, config),
            },
        }
    }

    fn handle_sender(&mut self, event: SessionEvent<'_>, now: Instant, config: &TpConfig) -> Step {
        let honor_cts = self.mode == Mode::Connection && config.cts_policy == CtsPolicy::Honor;
        match (event, self.state) {
            (SessionEvent::Transmitted, SessionState::Idle) => {
                match (self.mode, config.cts_policy) {
                    (Mode::Connection, CtsPolicy::Honor) => {
                        self.wait(SessionState::RtsSent, now, config.t3);
                    }
                    (Mode::Connection, CtsPolicy::Ignore) => {
                        self.send_window(1, self.num_packets, now);
                    }
                    (Mode::Broadcast, _) => {
                        self.send_window(1, self.num_packets, now + config.bam_inter_packet_delay);
                    }
                }
                Step::default()
            }
            (
                SessionEvent::Transmitted,
                SessionState::SendingData {
                    next_seq,
                    window_end,
                },
            ) => {
                if next_seq < window_end {
                    let at = match self.mode {
                        Mode::Broadcast => now + config.bam_inter_packet_delay,
                        Mode::Connection => now,
                    };
                    self.state = SessionState::SendingData {
                        next_seq: next_seq + 1,
                        window_end,
                    };
                    self.next_tx_at = at;
                    return Step::default();
                }
                match (next_seq >= self.num_packets, self.mode, honor_cts) {
                    (true, Mode::Broadcast, _) => self.finish(None),
                    (true, Mode::Connection, true) => {
                        self.wait(SessionState::AwaitingEom, now, config.t3);
                        Step::default()
                    }
                    (true, Mode::Connection, false) => {
                        // Reference mode: the sender closes the transfer itself.
                        self.state = SessionState::AwaitingEom;
                        self.deadline = None;
                        self.next_tx_at = now;
                        Step::default()
                    }
                    (false, _, _) => {
                        self.wait(SessionState::AwaitingCts, now, config.t3);
                        Step::default()
                    }
                }
            }
            (SessionEvent::Transmitted, SessionState::AwaitingEom) if !honor_cts => {
                self.finish(None)
            }
            (
                SessionEvent::Cts {
                    num_packets,
                    next_packet,
                },
                state,
            ) if honor_cts => match state {
                SessionState::SendingData { .. } => self.violation(AbortReason::CtsWhileSending),
                SessionState::RtsSent | SessionState::AwaitingCts | SessionState::AwaitingEom => {
                    if num_packets == 0 {
                        self.wait(SessionState::AwaitingCts, now, config.t4);
                        Step::default()
                    } else if next_packet == 0 || next_packet > self.num_packets {
                        self.violation(AbortReason::SequenceError)
                    } else {
                        let window_end = (next_packet as u16 + num_packets as u16 - 1)
                            .min(self.num_packets as u16) as u8;
                        self.send_window(next_packet, window_end, now);
                        Step::default()
                    }
                }
                _ => Step::default(),
            },
            (SessionEvent::EndOfMsgAck, SessionState::AwaitingEom) if honor_cts => {
                self.finish(None)
            }
            _ => Step::default(),
        }
    }

    fn handle_receiver(
        &mut self,
        event: SessionEvent<'_>,
        now: Instant,
        config: &TpConfig,
    ) -> Step {
        match (event, self.state) {
            (SessionEvent::Open, SessionState::Idle) => match self.mode {
                Mode::Connection => self.grant(1, now, config),
                Mode::Broadcast => {
                    self.state = SessionState::ReceivingData {
                        next_seq: 1,
                        window_end: self.num_packets,
                    };
                    self.deadline = Some(now + config.t1);
                    Step::default()
                }
            },
            (
                SessionEvent::Data(data),
                SessionState::CtsSent { window_end, .. }
                | SessionState::ReceivingData { window_end, .. },
            ) => {
                let SessionData::Inbound { reassembler, .. } = &mut self.data else {
                    return Step::default();
                };
                match reassembler.accept(data) {
                    Err(reason) => self.violation(reason),
                    Ok(DtProgress::Complete) => {
                        let ack = self.notify(self.end_of_msg_ack());
                        self.finish(ack)
                    }
                    Ok(DtProgress::Accepted { seq }) => {
                        if self.mode == Mode::Connection && seq >= window_end {
                            self.grant(seq + 1, now, config)
                        } else {
                            self.state = SessionState::ReceivingData {
                                next_seq: seq + 1,
                                window_end,
                            };
                            self.deadline = Some(now + config.t1);
                            Step::default()
                        }
                    }
                }
            }
            _ => Step::default(),
        }
    }

    /// Receiver: authorise the next window starting at `next_seq`.
    fn grant(&mut self, next_seq: u8, now: Instant, config: &TpConfig) -> Step {
        let max_window = match &self.data {
            SessionData::Inbound { max_window, .. } => *max_window,
            SessionData::Outbound(_) => NO_PACKET_LIMIT,
        };
        let remaining = self.num_packets - next_seq + 1;
        let window = remaining.min(max_window);
        self.state = SessionState::CtsSent {
            next_seq,
            window_end: next_seq + (window - 1),
        };
        self.deadline = Some(now + config.t2);
        Step::reply(ControlMessage::Cts {
            num_packets: window,
            next_packet: next_seq,
        })
    }

    fn send_window(&mut self, next_seq: u8, window_end: u8, at: Instant) {
        self.state = SessionState::SendingData {
            next_seq,
            window_end,
        };
        self.deadline = None;
        self.next_tx_at = at;
    }

    fn wait(&mut self, state: SessionState, now: Instant, timeout: embassy_time::Duration) {
        self.state = state;
        self.deadline = Some(now + timeout);
    }

    fn end_of_msg_ack(&self) -> ControlMessage {
        ControlMessage::EndOfMsgAck {
            total_len: self.total_len,
            num_packets: self.num_packets,
        }
    }

    /// Control replies only exist in connection mode.
    fn notify(&self, message: ControlMessage) -> Option<ControlMessage> {
        match self.mode {
            Mode::Connection => Some(message),
            Mode::Broadcast => None,
        }
    }

    fn violation(&mut self, reason: AbortReason) -> Step {
        let notify = self.notify(ControlMessage::Abort(reason));
        self.abort(AbortCause::Protocol(reason), notify)
    }

    fn abort(&mut self, cause: AbortCause, reply: Option<ControlMessage>) -> Step {
        #[cfg(feature = "defmt")]
        defmt::warn!("TP session {} aborted: {}", self.key, cause);
        self.state = SessionState::Aborted(cause.reason());
        self.deadline = None;
        Step {
            reply,
            termination: Some(Termination::Aborted(cause)),
        }
    }

    fn finish(&mut self, reply: Option<ControlMessage>) -> Step {
        #[cfg(feature = "defmt")]
        defmt::debug!("TP session {} done ({} bytes)", self.key, self.total_len);
        self.state = SessionState::Done;
        self.deadline = None;
        Step::completed(reply)
    }
}
