//! Consumer side of streamed calls.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use duet_wire::{CallId, Frame};

use crate::endpoint::{Endpoint, StreamSlot};
use crate::errors::CallError;

/// Depth of the per-stream mailbox between the driver and the consumer.
pub(crate) const STREAM_BUFFER: usize = 64;

/// Event delivered to a stream consumer's mailbox.
///
/// Terminal events latch: once `End` or `Error` is delivered the record is
/// gone and nothing follows.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Next(Value),
    End,
    Error(CallError),
}

enum StartError {
    Failed(CallError),
    /// The ack-timeout handler suppressed the error; the stream just ends.
    Suppressed,
}

/// A lazy, single-pass streamed call.
///
/// Nothing is sent until the first [`next`](CallStream::next); dropping the
/// stream releases its record, after which further frames for it are
/// discarded silently and the peer is not notified.
pub struct CallStream {
    endpoint: Endpoint,
    method: String,
    /// Present until the stream is started by the first `next`.
    args: Option<Vec<Value>>,
    id: Option<CallId>,
    events_rx: Option<mpsc::Receiver<StreamEvent>>,
    finished: bool,
}

impl CallStream {
    pub(crate) fn new(endpoint: Endpoint, method: String, args: Vec<Value>) -> Self {
        Self {
            endpoint,
            method,
            args: Some(args),
            id: None,
            events_rx: None,
            finished: false,
        }
    }

    /// The dotted method path this stream calls.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Advance the stream.
    ///
    /// Buffered values are delivered in receipt order; a terminal error is
    /// yielded once as `Some(Err(..))`; completion yields `None`. After any
    /// terminal, every subsequent call returns `None`.
    pub async fn next(&mut self) -> Option<Result<Value, CallError>> {
        if self.finished {
            return None;
        }
        if let Some(args) = self.args.take() {
            match self.start(args).await {
                Ok(()) => {}
                Err(StartError::Failed(err)) => {
                    self.finish();
                    return Some(Err(err));
                }
                Err(StartError::Suppressed) => {
                    self.finish();
                    return None;
                }
            }
        }
        let events_rx = self.events_rx.as_mut()?;
        match events_rx.recv().await {
            Some(StreamEvent::Next(value)) => Some(Ok(value)),
            Some(StreamEvent::Error(err)) => {
                self.finish();
                Some(Err(err))
            }
            Some(StreamEvent::End) => {
                self.finish();
                None
            }
            // Mailbox gone without a terminal: the endpoint closed under us.
            None => {
                self.finish();
                Some(Err(CallError::closed()))
            }
        }
    }

    /// Drain the remaining values into a vector, failing on a stream error.
    pub async fn collect(mut self) -> Result<Vec<Value>, CallError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    /// Install the record and post the request; runs the ack phase.
    async fn start(&mut self, args: Vec<Value>) -> Result<(), StartError> {
        if self.endpoint.is_closed() {
            return Err(StartError::Failed(CallError::closed()));
        }
        let (events_tx, events_rx) = mpsc::channel(STREAM_BUFFER);
        let ack_timeout = self.endpoint.ack_timeout();
        let (ack_tx, ack_rx) = match ack_timeout {
            Some(_) => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let id = self.endpoint.register_stream(StreamSlot {
            method: self.method.clone(),
            acked: false,
            events_tx,
            ack_tx,
        });
        self.id = Some(id);
        self.events_rx = Some(events_rx);
        debug!(id = %id, method = %self.method, "starting stream call");

        let frame = Frame::Request {
            id: Some(id),
            method: self.method.clone(),
            args: args.clone(),
            optional: false,
        };
        if let Err(err) = self.endpoint.post(frame).await {
            self.release();
            return Err(StartError::Failed(err));
        }

        if let (Some(limit), Some(ack_rx)) = (ack_timeout, ack_rx) {
            if tokio::time::timeout(limit, ack_rx).await.is_err() {
                // Only a genuine timeout if the record is still ours; a
                // racing terminal already queued an event to deliver.
                if self.endpoint.remove_stream(id).is_some() {
                    trace!(id = %id, method = %self.method, "stream ack timeout");
                    self.events_rx = None;
                    self.id = None;
                    if self.endpoint.consult_ack_timeout(&self.method, &args) {
                        return Err(StartError::Suppressed);
                    }
                    return Err(StartError::Failed(CallError::AckTimeout {
                        method: self.method.clone(),
                    }));
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        self.id = None;
        self.events_rx = None;
    }

    fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.endpoint.remove_stream(id);
        }
        self.events_rx = None;
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.endpoint.remove_stream(id).is_some() {
                trace!(id = %id, method = %self.method, "stream abandoned by consumer");
            }
        }
    }
}
