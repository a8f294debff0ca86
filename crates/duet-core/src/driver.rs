//! The per-endpoint driver: a future that owns the transport and routes
//! frames in both directions.
//!
//! All outbound traffic funnels through one queue, so frames from a single
//! caller go on the wire in call order. Inbound requests are dispatched on
//! spawned tasks; their responses re-enter the same outbound queue.

use std::io;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use duet_wire::{CallId, Frame};

use crate::endpoint::{Context, Endpoint};
use crate::errors::{CallError, RemoteError};
use crate::handlers::{Handler, NullHandler, Reply, ValueStream};
use crate::stream::StreamEvent;
use crate::transport::Transport;

/// Drives one endpoint's transport until the endpoint closes or the
/// transport fails. Must be spawned (or awaited) for the endpoint to make
/// progress.
pub struct Driver<T> {
    transport: T,
    endpoint: Endpoint,
    outbound_rx: mpsc::Receiver<Frame>,
}

impl<T: Transport> Driver<T> {
    pub(crate) fn new(transport: T, endpoint: Endpoint, outbound_rx: mpsc::Receiver<Frame>) -> Self {
        Self {
            transport,
            endpoint,
            outbound_rx,
        }
    }

    /// Run until the connection is done.
    ///
    /// Returns `Ok(())` on orderly shutdown (close, or the peer going away)
    /// and the transport error on a fatal failure. The transport is dropped
    /// on exit either way.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.endpoint.shared.shutdown.notified() => {
                    debug!("driver stopping: endpoint closed");
                    return Ok(());
                }
                frame = self.outbound_rx.recv() => match frame {
                    Some(frame) => self.send_frame(frame).await?,
                    None => return Ok(()),
                },
                inbound = self.transport.recv() => match inbound {
                    Ok(Some(frame)) => self.handle_frame(frame).await,
                    Ok(None) => {
                        debug!("transport closed by peer");
                        self.endpoint.close();
                        return Ok(());
                    }
                    // Malformed inbound payload: skip the frame, keep going.
                    Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                        warn!(error = %err, "failed to decode inbound frame");
                        self.endpoint
                            .report_general_error(&CallError::Transport(Arc::new(err)));
                    }
                    Err(err) => {
                        warn!(error = %err, "transport failed");
                        self.endpoint
                            .close_with(io::Error::new(err.kind(), err.to_string()));
                        return Err(err);
                    }
                },
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> io::Result<()> {
        trace!(frame = ?frame, "sending frame");
        match self.transport.send(&frame).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %err, "failed to encode outbound frame");
                // A response that cannot be encoded still owes the caller an
                // answer: retry once with the failure as the error payload.
                if let Frame::Response { id, .. } = frame {
                    let fallback = Frame::Response {
                        id,
                        result: None,
                        error: Some(
                            RemoteError {
                                kind: crate::errors::ErrorKind::Other,
                                message: format!("failed to encode response: {err}"),
                                method: None,
                                data: None,
                            }
                            .to_value(),
                        ),
                    };
                    if let Err(retry_err) = self.transport.send(&fallback).await {
                        warn!(error = %retry_err, "failed to send fallback error response");
                    }
                }
                self.endpoint
                    .report_general_error(&CallError::Transport(Arc::new(err)));
                Ok(())
            }
            Err(err) => {
                self.endpoint
                    .close_with(io::Error::new(err.kind(), err.to_string()));
                Err(err)
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        if self.endpoint.is_closed() {
            trace!(frame = ?frame, "dropping inbound frame after close");
            return;
        }
        match frame {
            Frame::Request {
                id,
                method,
                args,
                optional,
            } => self.handle_request(id, method, args, optional).await,
            Frame::Response { id, result, error } => {
                let outcome = match error {
                    Some(payload) => Err(CallError::Remote(RemoteError::from_value(payload))),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                self.deliver_response(id, outcome).await;
            }
            Frame::Ack { id } => self.endpoint.observe_ack(id),
            Frame::StreamNext { id, value } => {
                self.route_stream_event(id, StreamEvent::Next(value)).await;
            }
            Frame::StreamEnd { id } => self.finish_stream(id, None).await,
            Frame::StreamError { id, error } => self.finish_stream(id, Some(error)).await,
        }
    }

    async fn handle_request(
        &mut self,
        id: Option<CallId>,
        method: String,
        args: Vec<Value>,
        optional: bool,
    ) {
        // Receipt is acknowledged before the function is resolved or run.
        if let Some(id) = id {
            if self.send_frame(Frame::Ack { id }).await.is_err() {
                return;
            }
        }

        let ctx = self.endpoint.context(&method);
        let found = self.endpoint.functions().resolve(&method);
        let resolved = match &self.endpoint.shared.options.resolver {
            Some(resolver) => resolver(&ctx, &method, found),
            None => found,
        };
        let handler: Arc<dyn Handler> = match resolved {
            Some(handler) => handler,
            None if optional => {
                trace!(method = %method, "optional call on missing function");
                Arc::new(NullHandler)
            }
            None => {
                debug!(method = %method, "function not found");
                if let Some(id) = id {
                    let frame = Frame::Response {
                        id,
                        result: None,
                        error: Some(RemoteError::not_found(&method).to_value()),
                    };
                    let _ = self.send_frame(frame).await;
                }
                return;
            }
        };

        let endpoint = self.endpoint.clone();
        tokio::spawn(dispatch(endpoint, handler, ctx, id, method, args));
    }

    /// Hand a Response outcome to whichever record owns the id.
    ///
    /// A streamed call can be answered with a plain Response when the remote
    /// function is not a stream (or is missing); the stream then observes
    /// the value, if any, followed by its terminal.
    async fn deliver_response(&self, id: CallId, outcome: Result<Value, CallError>) {
        if self.endpoint.complete_call(id, outcome.clone()) {
            return;
        }
        if let Some(slot) = self.endpoint.remove_stream(id) {
            match outcome {
                Ok(Value::Null) => {
                    let _ = slot.events_tx.send(StreamEvent::End).await;
                }
                Ok(value) => {
                    let _ = slot.events_tx.send(StreamEvent::Next(value)).await;
                    let _ = slot.events_tx.send(StreamEvent::End).await;
                }
                Err(err) => {
                    let _ = slot.events_tx.send(StreamEvent::Error(err)).await;
                }
            }
        }
    }

    /// Push a value into a stream consumer's mailbox, in receipt order.
    async fn route_stream_event(&self, id: CallId, event: StreamEvent) {
        match self.endpoint.stream_sender(id) {
            Some(events_tx) => {
                if events_tx.send(event).await.is_err() {
                    trace!(id = %id, "stream consumer gone");
                }
            }
            None => trace!(id = %id, "dropping frame for unknown stream"),
        }
    }

    /// Terminal stream frames retire the record before the event lands.
    async fn finish_stream(&self, id: CallId, error: Option<Value>) {
        if let Some(slot) = self.endpoint.remove_stream(id) {
            let event = match error {
                Some(payload) => {
                    StreamEvent::Error(CallError::Remote(RemoteError::from_value(payload)))
                }
                None => StreamEvent::End,
            };
            if slot.events_tx.send(event).await.is_err() {
                trace!(id = %id, "stream consumer gone");
            }
            return;
        }
        // A plain call whose remote returned a sequence ends here instead.
        let _ = match error {
            Some(payload) => self
                .endpoint
                .complete_call(id, Err(CallError::Remote(RemoteError::from_value(payload)))),
            None => self.endpoint.complete_call(id, Ok(Value::Null)),
        };
    }
}

/// Invoke a handler and deliver whatever it produces.
async fn dispatch(
    endpoint: Endpoint,
    handler: Arc<dyn Handler>,
    ctx: Context,
    id: Option<CallId>,
    method: String,
    args: Vec<Value>,
) {
    let outcome = handler.invoke(ctx, args.clone()).await;
    match outcome {
        Ok(Reply::Value(value)) => {
            if let Some(id) = id {
                let frame = Frame::Response {
                    id,
                    result: Some(value),
                    error: None,
                };
                let _ = endpoint.post(frame).await;
            }
        }
        Ok(Reply::Stream(stream)) => match id {
            Some(id) => pump_stream(endpoint, id, method, stream).await,
            // Fire-and-forget: nothing may be emitted for it.
            None => debug!(method = %method, "discarding stream from fire-and-forget request"),
        },
        Err(err) => {
            let suppressed = endpoint
                .shared
                .options
                .on_function_error
                .as_ref()
                .is_some_and(|h| h(&err, &method, &args));
            if suppressed {
                debug!(method = %method, "function error suppressed");
                return;
            }
            warn!(method = %method, error = %err, "function raised");
            if let Some(id) = id {
                let frame = Frame::Response {
                    id,
                    result: None,
                    error: Some(RemoteError::function(&method, &err).to_value()),
                };
                let _ = endpoint.post(frame).await;
            }
        }
    }
}

/// Drive a handler's stream to the wire.
///
/// Individual values are not acknowledged; completion posts StreamEnd and a
/// failed item posts StreamError and stops.
async fn pump_stream(endpoint: Endpoint, id: CallId, method: String, mut stream: ValueStream) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => {
                if endpoint.post(Frame::StreamNext { id, value }).await.is_err() {
                    debug!(id = %id, method = %method, "stream pump stopping: endpoint gone");
                    return;
                }
            }
            Err(err) => {
                warn!(id = %id, method = %method, error = %err, "stream raised");
                let frame = Frame::StreamError {
                    id,
                    error: RemoteError::function(&method, &err).to_value(),
                };
                let _ = endpoint.post(frame).await;
                return;
            }
        }
    }
    let _ = endpoint.post(Frame::StreamEnd { id }).await;
}
