/// Test doubles simulating the CAN bus and the clock during integration tests.
use embassy_time::Instant;
use j1939_tp::protocol::transport::{
    can_frame::CanFrame,
    tp::{cm::ControlMessage, control_frame},
    traits::{bus_clock::BusClock, can_bus::CanBus},
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

#[allow(dead_code)]
/// PGN carried by every transfer in the tests.
pub const TEST_PGN: u32 = 0x00FECA;

#[derive(Clone)]
#[allow(dead_code)]
/// In-memory CAN bus reproducing the `CanBus` trait behavior.
pub struct MockCanBus {
    tx: mpsc::UnboundedSender<CanFrame>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<CanFrame>>>,
}

#[allow(dead_code)]
impl MockCanBus {
    /// Construct a pair of interconnected buses (DUT ↔ host).
    pub fn create_pair() -> (Self, Self) {
        let (dut_tx, host_rx) = mpsc::unbounded_channel();
        let (host_tx, dut_rx) = mpsc::unbounded_channel();

        let dut_bus = Self {
            tx: dut_tx,
            rx: Arc::new(Mutex::new(dut_rx)),
        };

        let host_bus = Self {
            tx: host_tx,
            rx: Arc::new(Mutex::new(host_rx)),
        };

        (dut_bus, host_bus)
    }

    /// Next frame, failing the test if nothing arrives within `millis`.
    pub async fn expect_frame(&mut self, millis: u64) -> CanFrame {
        tokio::time::timeout(Duration::from_millis(millis), self.recv())
            .await
            .expect("frame expected before the timeout")
            .expect("bus closed")
    }

    /// Every frame arriving until the bus stays quiet for `millis`.
    pub async fn drain_frames(&mut self, millis: u64) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        while let Ok(Ok(frame)) =
            tokio::time::timeout(Duration::from_millis(millis), self.recv()).await
        {
            frames.push(frame);
        }
        frames
    }
}

impl CanBus for MockCanBus {
    type Error = ();

    async fn send<'a>(&'a mut self, frame: &'a CanFrame) -> Result<usize, Self::Error> {
        self.tx.send(frame.clone()).map_err(|_| ())?;
        Ok(frame.len)
    }

    async fn recv(&mut self) -> Result<CanFrame, Self::Error> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(())
    }
}

#[allow(dead_code)]
/// Clock based on tokio time, so `start_paused` tests run in virtual time.
pub struct MockClock {
    start: tokio::time::Instant,
}

#[allow(dead_code)]
impl MockClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl BusClock for MockClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.start.elapsed().as_millis() as u64)
    }

    async fn delay_ms(&mut self, millis: u32) {
        sleep(Duration::from_millis(millis as u64)).await;
    }

    async fn yield_now(&mut self) {
        tokio::task::yield_now().await;
    }
}

#[allow(dead_code)]
/// TP.CM frame as a peer would emit it.
pub fn cm_frame(src: u8, dst: u8, message: ControlMessage) -> CanFrame {
    control_frame(src, dst, TEST_PGN, &message, 7).expect("valid TP.CM identifier")
}

#[allow(dead_code)]
/// Decode a TP.CM frame, checking it refers to [`TEST_PGN`].
pub fn decode_cm(frame: &CanFrame) -> ControlMessage {
    let (message, pgn) = ControlMessage::decode(frame.payload()).expect("TP.CM frame");
    assert_eq!(pgn, TEST_PGN);
    message
}
