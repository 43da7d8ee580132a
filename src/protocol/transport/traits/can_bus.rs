//! Minimal abstraction for an asynchronous CAN bus. Allows the library to plug
//! into various implementations (embedded HAL, SocketCAN, in-memory loopback).
use crate::protocol::transport::can_frame::CanFrame;
use futures_util::Future;

/// Contract to send and receive CAN frames asynchronously.
///
/// Binding the adapter to an interface (and releasing it) happens before the
/// value is handed to the transport layer.
pub trait CanBus {
    type Error: core::fmt::Debug;
    /// Emit a frame on the bus and report how many payload bytes were written.
    /// Anything short of `frame.len` is treated as a failed transmission.
    fn send<'a>(
        &'a mut self,
        frame: &'a CanFrame,
    ) -> impl Future<Output = Result<usize, Self::Error>> + 'a;
    /// Retrieve the next available frame. Asynchronously waits until data arrives.
    fn recv<'a>(
        &'a mut self,
    ) -> impl core::future::Future<Output = Result<CanFrame, Self::Error>> + 'a;
}
