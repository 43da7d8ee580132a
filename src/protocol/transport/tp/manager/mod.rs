//! Synchronous transport core: routes TP.CM / TP.DT frames to sessions,
//! schedules outbound frames and applies deadlines.
//!
//! The manager never performs I/O and never reads a clock. The owner feeds it
//! frames and the current [`Instant`], writes the frames it hands back and
//! reports each write through [`TpManager::on_transmitted`] or
//! [`TpManager::on_transmit_failed`]. Everything a session does therefore
//! happens between two frame writes.
use core::fmt::Debug;

use embassy_time::Instant;
use heapless::Vec;

use crate::error::{CanIdBuildError, ConfigError, TpError};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::tp::cm::{AbortReason, ControlMessage};
use crate::protocol::transport::tp::config::TpConfig;
use crate::protocol::transport::tp::control_frame;
use crate::protocol::transport::tp::session::{
    AbortCause, Mode, Role, Session, SessionEvent, SessionKey, Step, Termination,
};
use crate::protocol::transport::tp::session_table::SessionTable;
use crate::protocol::transport::{
    packet_count, ADDRESS_GLOBAL, MAX_PGN, MAX_TP_PAYLOAD, MIN_TP_PAYLOAD, PGN_TP_CM,
    PGN_TP_DT,
};

//==================================================================================TYPES
/// A multi-packet message rebuilt by a receiver session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub pgn: u32,
    pub priority: u8,
    pub source: u8,
    /// Own address, or [`ADDRESS_GLOBAL`] for a broadcast.
    pub destination: u8,
    pub data: Vec<u8, MAX_TP_PAYLOAD>,
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpEvent {
    Received(ReceivedMessage),
    Sent { key: SessionKey, pgn: u32 },
    Aborted {
        key: SessionKey,
        pgn: u32,
        cause: AbortCause,
    },
}

/// What to do after an inbound frame, an expiry or a cancel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Control frame to put on the bus.
    pub reply: Option<CanFrame>,
    /// Sessions that ended. An Abort may close both directions of a pair.
    pub events: Vec<TpEvent, 2>,
}

/// Frame a sender session wants written now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub key: SessionKey,
    pub frame: CanFrame,
}

//==================================================================================MANAGER
/// Session table plus configuration, for up to `N` concurrent sessions.
pub struct TpManager<const N: usize> {
    table: SessionTable<N>,
    config: TpConfig,
}

impl<const N: usize> TpManager<N> {
    pub fn new(config: TpConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            table: SessionTable::new(),
            config,
        })
    }

    pub fn config(&self) -> &TpConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable<N> {
        &self.table
    }

    /// Open a sender session. A global destination selects BAM.
    pub fn start_send<E: Debug>(
        &mut self,
        pgn: u32,
        priority: u8,
        source: u8,
        destination: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<SessionKey, TpError<E>> {
        if !(MIN_TP_PAYLOAD..=MAX_TP_PAYLOAD).contains(&payload.len()) {
            return Err(TpError::InvalidLength { len: payload.len() });
        }
        if pgn > MAX_PGN {
            return Err(TpError::Build(CanIdBuildError::InvalidData));
        }
        let session = Session::sender(
            SessionKey::sender(source, destination),
            pgn,
            priority,
            payload,
            now,
        );
        let key = self.table.insert(session)?;
        #[cfg(feature = "defmt")]
        defmt::info!(
            "TP send opened: pgn={=u32:#x} {} bytes {}->{}",
            pgn,
            payload.len(),
            source,
            destination
        );
        Ok(key)
    }

    /// Route one inbound frame. Anything that is not TP.CM / TP.DT is ignored.
    pub fn process_frame(&mut self, frame: &CanFrame, now: Instant) -> Dispatch {
        let src = frame.id.source_address();
        let dst = frame.id.destination().unwrap_or(ADDRESS_GLOBAL);
        match frame.id.pgn() {
            PGN_TP_CM => match ControlMessage::decode(frame.payload()) {
                Ok((message, pgn)) => {
                    self.process_control(message, pgn, src, dst, frame.id.priority(), now)
                }
                Err(_err) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("Malformed TP.CM from {}: {}", src, defmt::Debug2Format(&_err));
                    Dispatch::default()
                }
            },
            PGN_TP_DT => {
                let key = SessionKey::receiver(src, dst);
                self.drive(&key, SessionEvent::Data(&frame.data), now)
            }
            _ => Dispatch::default(),
        }
    }

    fn process_control(
        &mut self,
        message: ControlMessage,
        pgn: u32,
        src: u8,
        dst: u8,
        priority: u8,
        now: Instant,
    ) -> Dispatch {
        match message {
            ControlMessage::Rts {
                total_len,
                num_packets,
                max_packets_per_cts,
            } => {
                if dst == ADDRESS_GLOBAL {
                    return Dispatch::default();
                }
                self.open_receiver(
                    SessionKey::receiver(src, dst),
                    pgn,
                    priority,
                    Mode::Connection,
                    total_len,
                    num_packets,
                    max_packets_per_cts,
                    now,
                )
            }
            ControlMessage::Bam {
                total_len,
                num_packets,
            } => {
                if dst != ADDRESS_GLOBAL {
                    return Dispatch::default();
                }
                self.open_receiver(
                    SessionKey::receiver(src, dst),
                    pgn,
                    priority,
                    Mode::Broadcast,
                    total_len,
                    num_packets,
                    u8::MAX,
                    now,
                )
            }
            ControlMessage::Cts {
                num_packets,
                next_packet,
            } => self.drive_matching(
                &SessionKey::sender(dst, src),
                pgn,
                SessionEvent::Cts {
                    num_packets,
                    next_packet,
                },
                now,
            ),
            ControlMessage::EndOfMsgAck { .. } => self.drive_matching(
                &SessionKey::sender(dst, src),
                pgn,
                SessionEvent::EndOfMsgAck,
                now,
            ),
            ControlMessage::Abort(reason) => {
                let mut dispatch = self.drive_matching(
                    &SessionKey::sender(dst, src),
                    pgn,
                    SessionEvent::PeerAbort(reason),
                    now,
                );
                let receiver = self.drive_matching(
                    &SessionKey::receiver(src, dst),
                    pgn,
                    SessionEvent::PeerAbort(reason),
                    now,
                );
                for event in receiver.events {
                    let _ = dispatch.events.push(event);
                }
                dispatch
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open_receiver(
        &mut self,
        key: SessionKey,
        pgn: u32,
        priority: u8,
        mode: Mode,
        total_len: u16,
        num_packets: u8,
        max_packets_per_cts: u8,
        now: Instant,
    ) -> Dispatch {
        let len = total_len as usize;
        let rejection = if len > MAX_TP_PAYLOAD {
            Some(AbortReason::MessageTooLarge)
        } else if len < MIN_TP_PAYLOAD || packet_count(len) != num_packets as usize {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "Inconsistent announce from {}: {} bytes in {} packets",
                key.src,
                total_len,
                num_packets
            );
            return Dispatch::default();
        } else {
            let session = Session::receiver(
                key,
                pgn,
                priority,
                mode,
                total_len,
                max_packets_per_cts,
                &self.config,
                now,
            );
            match self.table.insert(session) {
                Ok(_) => None,
                Err(err) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP receive from {} rejected: {}", key.src, err);
                    Some(err.abort_reason())
                }
            }
        };

        match (rejection, mode) {
            (None, _) => {
                #[cfg(feature = "defmt")]
                defmt::info!(
                    "TP receive opened: pgn={=u32:#x} {} bytes from {}",
                    pgn,
                    total_len,
                    key.src
                );
                self.drive(&key, SessionEvent::Open, now)
            }
            (Some(reason), Mode::Connection) => Dispatch {
                reply: self.reply_frame(
                    key.dst,
                    key.src,
                    pgn,
                    ControlMessage::Abort(reason),
                    self.config.control_priority,
                ),
                events: Vec::new(),
            },
            (Some(_), Mode::Broadcast) => Dispatch::default(),
        }
    }

    /// Sender-side events only apply to the session carrying the same PGN.
    fn drive_matching(
        &mut self,
        key: &SessionKey,
        pgn: u32,
        event: SessionEvent<'_>,
        now: Instant,
    ) -> Dispatch {
        match self.table.get(key) {
            Some(session) if session.pgn() == pgn => self.drive(key, event, now),
            _ => Dispatch::default(),
        }
    }

    fn drive(&mut self, key: &SessionKey, event: SessionEvent<'_>, now: Instant) -> Dispatch {
        let config = &self.config;
        let Some(session) = self.table.get_mut(key) else {
            return Dispatch::default();
        };
        let step = session.handle(event, now, config);
        self.conclude(key, step)
    }

    /// Turn a transition result into a reply frame and, for terminal
    /// transitions, remove the session and report it.
    fn conclude(&mut self, key: &SessionKey, step: Step) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let Some(session) = self.table.get(key) else {
            return dispatch;
        };
        if let Some(message) = step.reply {
            dispatch.reply = self.reply_frame(
                key.local(),
                key.peer(),
                session.pgn(),
                message,
                self.config.control_priority,
            );
        }
        if let Some(termination) = step.termination {
            if let Some(session) = self.table.remove(key) {
                let _ = dispatch.events.push(event_for(&session, termination));
            }
        }
        dispatch
    }

    //==============================================================================TRANSMIT
    /// Due frame of the sender session that has waited longest, if any.
    pub fn next_transmit(&self, now: Instant) -> Option<Transmit> {
        let (session, outbound) = self
            .table
            .iter()
            .filter_map(|session| {
                session
                    .pending(now, &self.config)
                    .map(|outbound| (session, outbound))
            })
            .min_by_key(|(session, _)| session.next_wake(&self.config))?;

        let frame = session.frame_for(outbound, &self.config).ok()?;
        Some(Transmit {
            key: session.key(),
            frame,
        })
    }

    /// The frame returned by [`Self::next_transmit`] for `key` went out.
    pub fn on_transmitted(&mut self, key: &SessionKey, now: Instant) -> Option<TpEvent> {
        let mut dispatch = self.drive(key, SessionEvent::Transmitted, now);
        dispatch.events.pop()
    }

    /// The write for `key` failed: the session is dropped without notifying
    /// the peer.
    pub fn on_transmit_failed(&mut self, key: &SessionKey) -> Option<Session> {
        #[cfg(feature = "defmt")]
        defmt::warn!("TP session {} dropped after a failed write", key);
        self.table.remove(key)
    }

    //==============================================================================TIMING
    /// Abort the first session whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Dispatch {
        let expired = self
            .table
            .iter()
            .find(|session| session.is_expired(now))
            .map(|session| session.key());
        match expired {
            Some(key) => self.drive(&key, SessionEvent::Timeout, now),
            None => Dispatch::default(),
        }
    }

    /// Cancel a session locally; connection-mode peers get an Abort.
    pub fn abort(&mut self, key: &SessionKey, reason: AbortReason, now: Instant) -> Dispatch {
        self.drive(key, SessionEvent::Cancel(reason), now)
    }

    /// Earliest instant at which [`Self::expire`] or [`Self::next_transmit`]
    /// has something to do.
    pub fn next_wake(&self) -> Option<Instant> {
        self.table.next_wake(&self.config)
    }

    fn reply_frame(
        &self,
        src: u8,
        dst: u8,
        pgn: u32,
        message: ControlMessage,
        priority: u8,
    ) -> Option<CanFrame> {
        control_frame(src, dst, pgn, &message, priority).ok()
    }
}

fn event_for(session: &Session, termination: Termination) -> TpEvent {
    let key = session.key();
    let pgn = session.pgn();
    match (termination, key.role) {
        (Termination::Aborted(cause), _) => TpEvent::Aborted { key, pgn, cause },
        (Termination::Completed, Role::Sender) => TpEvent::Sent { key, pgn },
        (Termination::Completed, Role::Receiver) => {
            let mut data = Vec::new();
            let _ = data.extend_from_slice(session.received_payload().unwrap_or(&[]));
            TpEvent::Received(ReceivedMessage {
                pgn,
                priority: session.priority(),
                source: key.src,
                destination: key.dst,
                data,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
