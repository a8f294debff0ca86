#![deny(unsafe_code)]

//! Newline-delimited JSON framing for async byte streams.
//!
//! Each frame is one JSON object followed by `\n`. This module is generic
//! over the stream type - it works with any `AsyncRead + AsyncWrite + Unpin`,
//! including TCP sockets, Unix domain sockets, and pipes.
//!
//! Decode failures surface as `io::ErrorKind::InvalidData`, which the driver
//! treats as a skipped frame rather than a dead connection. Frames with an
//! unrecognized tag are skipped inside `recv`.

use std::io;

use duet_core::Transport;
use duet_wire::{Frame, codec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// A JSON-lines framed byte-stream connection.
pub struct JsonLinesFramed<S> {
    stream: S,
    buf: Vec<u8>,
    /// Start of not-yet-consumed bytes in `buf`.
    unread_start: usize,
    /// Buffer for encoding frames to avoid reallocations.
    encode_buf: Vec<u8>,
}

impl<S> JsonLinesFramed<S> {
    /// Create a new framed connection from an async byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
            encode_buf: Vec::with_capacity(1024),
        }
    }

    /// Get a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the framed wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Pop the next complete line out of the buffer, if one is there.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let rel = self.buf[self.unread_start..]
            .iter()
            .position(|b| *b == b'\n')?;
        let end = self.unread_start + rel;
        let line = self.buf[self.unread_start..end].to_vec();
        self.unread_start = end + 1;
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
        }
        Some(line)
    }
}

impl<S> JsonLinesFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.encode_buf = codec::encode_frame(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.encode_buf.push(b'\n');
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await
    }

    async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            while let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match codec::decode_frame(&line) {
                    Ok(Some(frame)) => return Ok(Some(frame)),
                    // Unknown tag: skip the frame, keep the connection.
                    Ok(None) => continue,
                    Err(e) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("json: {e}"),
                        ));
                    }
                }
            }

            let mut tmp = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len().saturating_sub(self.unread_start);
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no frame delimiter"),
                    ));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

impl<S> Transport for JsonLinesFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.send_frame(frame).await
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        self.recv_frame().await
    }
}
