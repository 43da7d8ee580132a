//! Monotonic clock abstraction providing the timing primitives required by
//! the transport sessions: deadlines, inter-packet pacing and cooperative yields.
use embassy_time::Instant;

/// Time source and suspension points for the cooperative transport loop.
pub trait BusClock {
    /// Current monotonic time. Only millisecond resolution is relied upon.
    fn now(&self) -> Instant;

    /// Asynchronously wait for `millis` milliseconds.
    fn delay_ms<'a>(&'a mut self, millis: u32)
        -> impl core::future::Future<Output = ()> + 'a;

    /// Give other pending work a chance to run between two frames.
    fn yield_now<'a>(&'a mut self) -> impl core::future::Future<Output = ()> + 'a {
        self.delay_ms(0)
    }
}
