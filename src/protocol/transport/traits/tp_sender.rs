//! `CanBus` extension performing one multi-packet transfer end to end,
//! without a session table or a background loop.
//!
//! The bus is used exclusively for the duration of the call: inbound frames
//! that do not belong to the transfer are discarded. Use
//! [`TpNode`](crate::protocol::transport::tp::node::TpNode) when the bus is
//! shared with other traffic.
use crate::{
    error::{CanIdBuildError, TpError},
    protocol::transport::{
        can_frame::CanFrame,
        tp::{
            cm::ControlMessage,
            config::TpConfig,
            control_frame,
            session::{Session, SessionEvent, SessionKey, Step, Termination},
        },
        traits::{bus_clock::BusClock, can_bus::CanBus},
        MAX_PGN, MAX_TP_PAYLOAD, MIN_TP_PAYLOAD, PGN_TP_CM,
    },
};
use futures_util::{future::select, future::Either, pin_mut, FutureExt};

/// Trait extending `CanBus` with a blocking-style transport send.
pub trait TpSender: CanBus
where
    <Self as CanBus>::Error: core::fmt::Debug,
{
    /// Send `payload` (9..=1785 bytes) from `source` to `destination`.
    ///
    /// A global destination runs a BAM transfer paced by
    /// `config.bam_inter_packet_delay`. Otherwise RTS/CTS is used, following
    /// `config.cts_policy`.
    ///
    /// # Errors
    ///
    /// - [`TpError::InvalidLength`] / [`TpError::Config`] / [`TpError::Build`]
    ///   before anything is sent
    /// - [`TpError::Io`] / [`TpError::ShortWrite`] when the bus fails
    /// - [`TpError::Timeout`], [`TpError::PeerAbort`], [`TpError::Protocol`]
    ///   when the transfer is aborted
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use j1939_tp::protocol::transport::{tp::config::TpConfig, traits::tp_sender::TpSender};
    ///
    /// can_bus
    ///     .send_tp(0xFECA, 6, my_address, 0x20, &payload, &mut clock, &TpConfig::default())
    ///     .await?;
    /// ```
    #[allow(clippy::too_many_arguments)]
    fn send_tp<'a, T: BusClock>(
        &'a mut self,
        pgn: u32,
        priority: u8,
        source: u8,
        destination: u8,
        payload: &'a [u8],
        clock: &'a mut T,
        config: &'a TpConfig,
    ) -> impl core::future::Future<Output = Result<(), TpError<Self::Error>>> + 'a;
}

impl<C: CanBus> TpSender for C
where
    C::Error: core::fmt::Debug,
{
    #[allow(clippy::too_many_arguments)]
    fn send_tp<'a, T: BusClock>(
        &'a mut self,
        pgn: u32,
        priority: u8,
        source: u8,
        destination: u8,
        payload: &'a [u8],
        clock: &'a mut T,
        config: &'a TpConfig,
    ) -> impl core::future::Future<Output = Result<(), TpError<Self::Error>>> + 'a {
        async move {
            config.validate()?;
            if !(MIN_TP_PAYLOAD..=MAX_TP_PAYLOAD).contains(&payload.len()) {
                return Err(TpError::InvalidLength { len: payload.len() });
            }
            if pgn > MAX_PGN {
                return Err(TpError::Build(CanIdBuildError::InvalidData));
            }
            let key = SessionKey::sender(source, destination);
            let mut session = Session::sender(key, pgn, priority, payload, clock.now());

            loop {
                let now = clock.now();

                // Step 1: deadline.
                if session.is_expired(now) {
                    let step = session.handle(SessionEvent::Timeout, now, config);
                    if let Some(result) = settle(self, &session, step, config).await? {
                        return result;
                    }
                    continue;
                }

                // Step 2: due frame, once the frames already on the bus are seen.
                if let Some(outbound) = session.pending(now, config) {
                    if let Some(received) = self.recv().now_or_never() {
                        let frame = received.map_err(TpError::Io)?;
                        if let Some(event) = peer_event(&frame, &session) {
                            let step = session.handle(event, clock.now(), config);
                            if let Some(result) = settle(self, &session, step, config).await? {
                                return result;
                            }
                        }
                        continue;
                    }
                    let frame = session.frame_for(outbound, config)?;
                    write(self, &frame).await?;
                    clock.yield_now().await;
                    let step = session.handle(SessionEvent::Transmitted, clock.now(), config);
                    if let Some(result) = settle(self, &session, step, config).await? {
                        return result;
                    }
                    continue;
                }

                // Step 3: wait for the peer or the next wake-up.
                let delay = session.next_wake(config).map(|wake| {
                    wake.saturating_duration_since(now)
                        .as_millis()
                        .min(u32::MAX as u64) as u32
                });
                let received = {
                    let recv_future = self.recv();
                    let delay_future = async {
                        match delay {
                            Some(millis) => clock.delay_ms(millis).await,
                            None => core::future::pending::<()>().await,
                        }
                    };
                    pin_mut!(recv_future);
                    pin_mut!(delay_future);
                    match select(recv_future, delay_future).await {
                        Either::Left((result, _)) => Some(result.map_err(TpError::Io)?),
                        Either::Right(((), _)) => None,
                    }
                };

                let Some(frame) = received else {
                    continue;
                };
                let Some(event) = peer_event(&frame, &session) else {
                    continue;
                };
                let step = session.handle(event, clock.now(), config);
                if let Some(result) = settle(self, &session, step, config).await? {
                    return result;
                }
            }
        }
    }
}

/// Control message from the peer about this transfer, as a session event.
fn peer_event(frame: &CanFrame, session: &Session) -> Option<SessionEvent<'static>> {
    let key = session.key();
    if frame.id.pgn() != PGN_TP_CM
        || frame.id.source_address() != key.dst
        || frame.id.destination() != Some(key.src)
    {
        return None;
    }
    let (message, pgn) = ControlMessage::decode(frame.payload()).ok()?;
    if pgn != session.pgn() {
        return None;
    }
    match message {
        ControlMessage::Cts {
            num_packets,
            next_packet,
        } => Some(SessionEvent::Cts {
            num_packets,
            next_packet,
        }),
        ControlMessage::EndOfMsgAck { .. } => Some(SessionEvent::EndOfMsgAck),
        ControlMessage::Abort(reason) => Some(SessionEvent::PeerAbort(reason)),
        _ => None,
    }
}

/// Send the step's reply and turn a terminal step into the call's result.
async fn settle<C: CanBus>(
    bus: &mut C,
    session: &Session,
    step: Step,
    config: &TpConfig,
) -> Result<Option<Result<(), TpError<C::Error>>>, TpError<C::Error>> {
    let key = session.key();
    if let Some(message) = step.reply {
        let frame = control_frame(
            key.local(),
            key.peer(),
            session.pgn(),
            &message,
            config.control_priority,
        )?;
        write(bus, &frame).await?;
    }
    Ok(match step.termination {
        Some(Termination::Completed) => Some(Ok(())),
        Some(Termination::Aborted(cause)) => Some(Err(cause.into())),
        None => None,
    })
}

async fn write<C: CanBus>(bus: &mut C, frame: &CanFrame) -> Result<(), TpError<C::Error>> {
    let written = bus.send(frame).await.map_err(TpError::Io)?;
    if written < frame.len {
        return Err(TpError::ShortWrite {
            written,
            expected: frame.len,
        });
    }
    Ok(())
}
