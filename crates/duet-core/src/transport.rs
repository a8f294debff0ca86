//! Frame transport abstraction.
//!
//! A transport ferries [`Frame`]s between exactly two endpoints. The engine
//! assumes only that a sent frame arrives at most once, intact or not at all;
//! ordering and reliability are whatever the substrate provides.
//!
//! Implementations:
//! - `MemoryTransport` from `duet-memory` for in-process channels (frames
//!   move by value, the identity serialization)
//! - `JsonLinesFramed` from `duet-stream` for byte streams (pipes, sockets)

use std::future::Future;
use std::io;

use duet_wire::Frame;

/// Trait for transports that can send and receive duet frames.
///
/// `recv` returning `Ok(None)` means the peer is gone; the driver closes the
/// endpoint. An `InvalidData` error marks a malformed payload and is
/// recoverable (the frame is skipped, the general-error handler consulted);
/// any other error is fatal and closes the endpoint with the error as cause.
///
/// Dropping the transport releases whatever registration the substrate
/// required; the driver drops it when the endpoint closes.
pub trait Transport: Send + Sync {
    /// Send a frame to the peer.
    fn send(&mut self, frame: &Frame) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next frame (until one arrives or the peer goes away).
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send;
}
