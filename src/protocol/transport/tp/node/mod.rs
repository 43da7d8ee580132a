//! Async transport node: owns the bus, the clock and a [`TpManager`], and is
//! the only place where frames are written.
//!
//! Everything runs in one cooperative loop ([`TpNode::poll`]). Each iteration
//! does one thing: apply a queued command, expire a session, route a frame
//! already waiting on the bus, write one due frame (then yield), or sleep
//! until a frame, a command or the next session deadline arrives. Two
//! sessions therefore never interleave mid-frame, and a peer Abort or a
//! cancellation lands between two frame writes.
//!
//! Other tasks talk to the node through an optional pre-allocated
//! [`embassy_sync::channel::Channel`] of [`TpCommand`]s and the matching
//! [`TpHandle`]. No allocation is performed.
use core::convert::Infallible;
use core::fmt::Debug;

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Sender},
};
use embassy_time::Instant;
use futures_util::{future::select, future::Either, pin_mut, FutureExt};
use heapless::{Deque, Vec};

use crate::error::{ConfigError, TpError};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::tp::cm::AbortReason;
use crate::protocol::transport::tp::config::TpConfig;
use crate::protocol::transport::tp::manager::{Dispatch, ReceivedMessage, TpEvent, TpManager};
use crate::protocol::transport::tp::session::SessionKey;
use crate::protocol::transport::traits::{bus_clock::BusClock, can_bus::CanBus};
use crate::protocol::transport::{
    ADDRESS_GLOBAL, MAX_TP_PAYLOAD, MIN_TP_PAYLOAD, PGN_TP_CM, PGN_TP_DT,
};

/// Completed inbound messages kept until [`TpNode::recv`] collects them.
pub const INBOX_CAPACITY: usize = 4;

/// Channel type carrying commands to a node.
pub type CommandChannel<const CMD_CAP: usize> =
    Channel<CriticalSectionRawMutex, TpCommand, CMD_CAP>;

//==================================================================================COMMANDS
/// Requests queued by other tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpCommand {
    /// Open a sender session from the node's address.
    Send {
        pgn: u32,
        priority: u8,
        destination: u8,
        payload: Vec<u8, MAX_TP_PAYLOAD>,
    },
    /// Cancel an active session.
    Abort { key: SessionKey, reason: AbortReason },
}

/// Producer side of a node's command channel.
pub struct TpHandle<'a, const CMD_CAP: usize> {
    sender: Sender<'a, CriticalSectionRawMutex, TpCommand, CMD_CAP>,
}

impl<'a, const CMD_CAP: usize> TpHandle<'a, CMD_CAP> {
    /// Queue a transfer. The outcome is only visible in the node's logs.
    pub async fn send(
        &self,
        pgn: u32,
        priority: u8,
        destination: u8,
        payload: &[u8],
    ) -> Result<(), TpError<Infallible>> {
        if !(MIN_TP_PAYLOAD..=MAX_TP_PAYLOAD).contains(&payload.len()) {
            return Err(TpError::InvalidLength { len: payload.len() });
        }
        let mut buffer = Vec::new();
        buffer
            .extend_from_slice(payload)
            .map_err(|_| TpError::InvalidLength { len: payload.len() })?;
        self.sender
            .send(TpCommand::Send {
                pgn,
                priority,
                destination,
                payload: buffer,
            })
            .await;
        Ok(())
    }

    /// Queue the cancellation of `key`.
    pub async fn abort(&self, key: SessionKey, reason: AbortReason) {
        self.sender.send(TpCommand::Abort { key, reason }).await;
    }
}

//==================================================================================NODE
enum Wake<E> {
    Frame(Result<CanFrame, E>),
    Timer,
    Command(TpCommand),
}

/// Transport endpoint bound to one source address, with up to `N` sessions.
pub struct TpNode<'a, C: CanBus, T: BusClock, const N: usize, const CMD_CAP: usize> {
    bus: C,
    clock: T,
    address: u8,
    manager: TpManager<N>,
    commands: Option<&'a CommandChannel<CMD_CAP>>,
    inbox: Deque<ReceivedMessage, INBOX_CAPACITY>,
    awaiting: Option<SessionKey>,
    outcome: Option<Result<(), TpError<C::Error>>>,
}

impl<'a, C, T, const N: usize, const CMD_CAP: usize> TpNode<'a, C, T, N, CMD_CAP>
where
    C: CanBus,
    C::Error: Debug,
    T: BusClock,
{
    pub fn new(bus: C, clock: T, address: u8, config: TpConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bus,
            clock,
            address,
            manager: TpManager::new(config)?,
            commands: None,
            inbox: Deque::new(),
            awaiting: None,
            outcome: None,
        })
    }

    /// Accept commands from other tasks through `channel`.
    pub fn with_commands(mut self, channel: &'a CommandChannel<CMD_CAP>) -> Self {
        self.commands = Some(channel);
        self
    }

    /// Producer handle, when a command channel is attached.
    pub fn handle(&self) -> Option<TpHandle<'a, CMD_CAP>> {
        self.commands.map(|channel| TpHandle {
            sender: channel.sender(),
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn manager(&self) -> &TpManager<N> {
        &self.manager
    }

    /// Release the bus and the clock.
    pub fn into_inner(self) -> (C, T) {
        (self.bus, self.clock)
    }

    /// Transfer `payload` (9..=1785 bytes) to `destination`, BAM when it is
    /// the global address. Returns once the session is over.
    ///
    /// Frames and commands for other sessions keep being served meanwhile;
    /// messages completed in the background are queued for [`Self::recv`].
    /// A bus error that concerns another session is logged and does not end
    /// this one.
    pub async fn send(
        &mut self,
        pgn: u32,
        priority: u8,
        destination: u8,
        payload: &[u8],
    ) -> Result<(), TpError<C::Error>> {
        let now = self.clock.now();
        let key = self
            .manager
            .start_send(pgn, priority, self.address, destination, payload, now)?;
        self.awaiting = Some(key);
        self.outcome = None;

        // Failures of this session's own writes arrive through `outcome`;
        // anything else `poll` reports concerns other traffic.
        let result = loop {
            if let Some(outcome) = self.outcome.take() {
                break outcome;
            }
            if let Err(_err) = self.poll().await {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "TP node error while sending pgn {=u32:#x}: {}",
                    pgn,
                    defmt::Debug2Format(&_err)
                );
                self.clock.yield_now().await;
            }
        };
        self.awaiting = None;
        result
    }

    /// Next reassembled message addressed to this node or broadcast.
    pub async fn recv(&mut self) -> Result<ReceivedMessage, TpError<C::Error>> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(message);
            }
            self.poll().await?;
        }
    }

    /// Cancel a session; a connection-mode peer receives an Abort.
    pub async fn abort(
        &mut self,
        key: SessionKey,
        reason: AbortReason,
    ) -> Result<(), TpError<C::Error>> {
        let now = self.clock.now();
        let dispatch = self.manager.abort(&key, reason, now);
        self.deliver(dispatch).await
    }

    /// Feed a frame obtained outside [`Self::poll`].
    ///
    /// Frames that are not TP.CM / TP.DT, that come from this node, or that
    /// are addressed to another node are dropped.
    pub async fn handle_frame(&mut self, frame: &CanFrame) -> Result<(), TpError<C::Error>> {
        let pgn = frame.id.pgn();
        if pgn != PGN_TP_CM && pgn != PGN_TP_DT {
            return Ok(());
        }
        if frame.id.source_address() == self.address {
            return Ok(());
        }
        match frame.id.destination() {
            Some(dst) if dst == self.address || dst == ADDRESS_GLOBAL => {}
            _ => return Ok(()),
        }
        let now = self.clock.now();
        let dispatch = self.manager.process_frame(frame, now);
        self.deliver(dispatch).await
    }

    /// One iteration of the cooperative loop.
    pub async fn poll(&mut self) -> Result<(), TpError<C::Error>> {
        if let Some(channel) = self.commands {
            if let Ok(command) = channel.try_receive() {
                return self.execute(command).await;
            }
        }

        let now = self.clock.now();
        let dispatch = self.manager.expire(now);
        if dispatch != Dispatch::default() {
            return self.deliver(dispatch).await;
        }

        if let Some(received) = self.bus.recv().now_or_never() {
            return match received {
                Ok(frame) => self.handle_frame(&frame).await,
                Err(err) => Err(TpError::Io(err)),
            };
        }

        if let Some(transmit) = self.manager.next_transmit(now) {
            return match self.write(&transmit.frame).await {
                Ok(()) => {
                    let now = self.clock.now();
                    if let Some(event) = self.manager.on_transmitted(&transmit.key, now) {
                        self.absorb(event);
                    }
                    Ok(())
                }
                Err(err) => {
                    self.manager.on_transmit_failed(&transmit.key);
                    if self.awaiting == Some(transmit.key) {
                        self.outcome = Some(Err(err));
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
            };
        }

        match self.wait(now).await {
            Wake::Frame(Ok(frame)) => self.handle_frame(&frame).await,
            Wake::Frame(Err(err)) => Err(TpError::Io(err)),
            Wake::Timer => Ok(()),
            Wake::Command(command) => self.execute(command).await,
        }
    }

    /// Sleep until a frame, a command or the next session wake-up.
    async fn wait(&mut self, now: Instant) -> Wake<C::Error> {
        let delay = self.manager.next_wake().map(|wake| {
            wake.saturating_duration_since(now)
                .as_millis()
                .min(u32::MAX as u64) as u32
        });
        let commands = self.commands;
        let clock = &mut self.clock;

        let recv_future = self.bus.recv();
        let timer_future = async move {
            match delay {
                Some(millis) => clock.delay_ms(millis).await,
                None => core::future::pending::<()>().await,
            }
        };
        let command_future = async move {
            match commands {
                Some(channel) => channel.receive().await,
                None => core::future::pending::<TpCommand>().await,
            }
        };
        pin_mut!(recv_future);
        pin_mut!(timer_future);
        pin_mut!(command_future);

        match select(recv_future, select(timer_future, command_future)).await {
            Either::Left((result, _)) => Wake::Frame(result),
            Either::Right((Either::Left(((), _)), _)) => Wake::Timer,
            Either::Right((Either::Right((command, _)), _)) => Wake::Command(command),
        }
    }

    async fn execute(&mut self, command: TpCommand) -> Result<(), TpError<C::Error>> {
        match command {
            TpCommand::Send {
                pgn,
                priority,
                destination,
                payload,
            } => {
                let now = self.clock.now();
                let opened = self.manager.start_send::<C::Error>(
                    pgn,
                    priority,
                    self.address,
                    destination,
                    &payload,
                    now,
                );
                if let Err(_err) = opened {
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "Queued TP send of pgn {=u32:#x} refused: {}",
                        pgn,
                        defmt::Debug2Format(&_err)
                    );
                }
                Ok(())
            }
            TpCommand::Abort { key, reason } => self.abort(key, reason).await,
        }
    }

    async fn deliver(&mut self, dispatch: Dispatch) -> Result<(), TpError<C::Error>> {
        for event in dispatch.events {
            self.absorb(event);
        }
        match dispatch.reply {
            Some(frame) => self.write(&frame).await,
            None => Ok(()),
        }
    }

    fn absorb(&mut self, event: TpEvent) {
        match event {
            TpEvent::Received(message) => {
                if self.inbox.is_full() {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("TP inbox full, dropping the oldest message");
                    self.inbox.pop_front();
                }
                let _ = self.inbox.push_back(message);
            }
            TpEvent::Sent { key, .. } if self.awaiting == Some(key) => {
                self.outcome = Some(Ok(()));
            }
            TpEvent::Aborted { key, cause, .. } if self.awaiting == Some(key) => {
                self.outcome = Some(Err(cause.into()));
            }
            _other => {
                #[cfg(feature = "defmt")]
                defmt::debug!("TP session finished: {}", defmt::Debug2Format(&_other));
            }
        }
    }

    /// Write one frame, then let other tasks run.
    async fn write(&mut self, frame: &CanFrame) -> Result<(), TpError<C::Error>> {
        let written = self.bus.send(frame).await.map_err(TpError::Io)?;
        if written < frame.len {
            return Err(TpError::ShortWrite {
                written,
                expected: frame.len,
            });
        }
        self.clock.yield_now().await;
        Ok(())
    }
}
