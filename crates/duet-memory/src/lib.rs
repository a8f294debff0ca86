#![deny(unsafe_code)]

//! In-memory transport for duet endpoints.
//!
//! A bidirectional [`MemoryTransport`] pair backed by in-process channels.
//! Frames move by value (the identity serialization), which suits channels
//! that already clone. Useful for tests, benchmarks, and same-process
//! endpoints.
//!
//! # Example
//!
//! ```ignore
//! use duet_core::{Endpoint, EndpointOptions, Handlers};
//! use duet_memory::memory_pair;
//!
//! let (a, b) = memory_pair(256);
//! let (left, left_driver) = Endpoint::new(a, Handlers::new(), EndpointOptions::default());
//! let (right, right_driver) = Endpoint::new(b, Handlers::new(), EndpointOptions::default());
//! tokio::spawn(left_driver.run());
//! tokio::spawn(right_driver.run());
//! ```

use std::io;

use duet_core::Transport;
use duet_wire::Frame;
use tokio::sync::mpsc;

/// A frame transport backed by in-process channels.
///
/// Create connected endpoints with [`memory_pair`].
pub struct MemoryTransport {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    fn new(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Self {
        Self { tx, rx }
    }
}

/// Create a connected pair of in-memory transports.
///
/// `buffer` is the channel capacity for each direction.
pub fn memory_pair(buffer: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(buffer);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(buffer);

    let a = MemoryTransport::new(a_to_b_tx, b_to_a_rx);
    let b = MemoryTransport::new(b_to_a_tx, a_to_b_rx);
    (a, b)
}

impl Transport for MemoryTransport {
    async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.tx
            .send(frame.clone())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer disconnected"))
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }
}
