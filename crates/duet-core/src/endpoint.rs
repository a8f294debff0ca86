//! One side of the RPC: configuration, the call surface, and the
//! correlation/stream tables.

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use duet_wire::{CallId, Frame};

use crate::caller::RemoteMethod;
use crate::driver::Driver;
use crate::errors::{CallError, HandlerError};
use crate::handlers::{Handler, Handlers};
use crate::hook::{CallHook, CallRequest, Next};
use crate::stream::{CallStream, StreamEvent};
use crate::transport::Transport;

/// Default response timeout; disable with
/// [`EndpointOptions::no_response_timeout`].
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound frame queue depth between handles and the driver.
pub(crate) const OUTBOUND_BUFFER: usize = 1024;

/// Receiver-side invocation context, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// Handlers receive the endpoint handle and can call back through it.
    #[default]
    Endpoint,
    /// Handlers see only the function tree and metadata.
    Functions,
}

/// Handler consulted when a response or ack timer fires; receives the method
/// path and the call-site arguments, returns `true` to suppress the default
/// rejection (the call then resolves with `Value::Null`).
pub type TimeoutHandler = Arc<dyn Fn(&str, &[Value]) -> bool + Send + Sync>;

/// Handler consulted when a local function raises; returns `true` to
/// suppress the error Response entirely.
pub type FunctionErrorHandler = Arc<dyn Fn(&HandlerError, &str, &[Value]) -> bool + Send + Sync>;

/// Handler consulted for transport/codec failures; returns `true` when the
/// error has been dealt with.
pub type GeneralErrorHandler = Arc<dyn Fn(&CallError) -> bool + Send + Sync>;

/// Hook that may substitute the handler a path resolves to. Receives the
/// invocation context, the path, and the default resolution.
pub type Resolver =
    Arc<dyn Fn(&Context, &str, Option<Arc<dyn Handler>>) -> Option<Arc<dyn Handler>> + Send + Sync>;

/// Endpoint configuration; immutable for the life of the endpoint.
#[derive(Clone)]
pub struct EndpointOptions {
    pub(crate) response_timeout: Option<Duration>,
    pub(crate) ack_timeout: Option<Duration>,
    pub(crate) binding: Binding,
    pub(crate) meta: Option<Value>,
    pub(crate) event_methods: HashSet<String>,
    pub(crate) resolver: Option<Resolver>,
    pub(crate) hook: Option<Arc<dyn CallHook>>,
    pub(crate) on_timeout: Option<TimeoutHandler>,
    pub(crate) on_ack_timeout: Option<TimeoutHandler>,
    pub(crate) on_function_error: Option<FunctionErrorHandler>,
    pub(crate) on_general_error: Option<GeneralErrorHandler>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            ack_timeout: None,
            binding: Binding::default(),
            meta: None,
            event_methods: HashSet::new(),
            resolver: None,
            hook: None,
            on_timeout: None,
            on_ack_timeout: None,
            on_function_error: None,
            on_general_error: None,
        }
    }
}

impl EndpointOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait for a Response after the request is delivered.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Wait for responses forever.
    pub fn no_response_timeout(mut self) -> Self {
        self.response_timeout = None;
        self
    }

    /// How long to wait for delivery acknowledgment. `Duration::ZERO` means
    /// the Ack must already have arrived by the time the timer is checked.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn binding(mut self, binding: Binding) -> Self {
        self.binding = binding;
        self
    }

    /// Opaque metadata exposed to handlers and resolvers via [`Context`].
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Designate a method name as an event: calls to it are always sent
    /// fire-and-forget.
    pub fn event_method(mut self, name: impl Into<String>) -> Self {
        self.event_methods.insert(name.into());
        self
    }

    pub fn event_methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_methods.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn resolver(
        mut self,
        resolver: impl Fn(&Context, &str, Option<Arc<dyn Handler>>) -> Option<Arc<dyn Handler>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn hook(mut self, hook: impl CallHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn on_timeout(mut self, f: impl Fn(&str, &[Value]) -> bool + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Arc::new(f));
        self
    }

    pub fn on_ack_timeout(
        mut self,
        f: impl Fn(&str, &[Value]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_ack_timeout = Some(Arc::new(f));
        self
    }

    pub fn on_function_error(
        mut self,
        f: impl Fn(&HandlerError, &str, &[Value]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_function_error = Some(Arc::new(f));
        self
    }

    pub fn on_general_error(mut self, f: impl Fn(&CallError) -> bool + Send + Sync + 'static) -> Self {
        self.on_general_error = Some(Arc::new(f));
        self
    }
}

/// Explicit form of an outbound call, exposing all options.
#[derive(Debug, Clone, Default)]
pub struct RawCall {
    pub method: String,
    pub args: Vec<Value>,
    /// Send fire-and-forget; resolves to `Value::Null` once posted.
    pub event: bool,
    /// Tolerate a missing remote function (resolves to `Value::Null`).
    pub optional: bool,
}

/// Context handed to every local handler invocation.
#[derive(Clone)]
pub struct Context {
    pub(crate) method: String,
    pub(crate) meta: Option<Value>,
    pub(crate) functions: Handlers,
    pub(crate) endpoint: Option<Endpoint>,
}

impl Context {
    /// The dotted path this invocation was addressed to.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Metadata from the endpoint configuration.
    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// The local function tree.
    pub fn functions(&self) -> &Handlers {
        &self.functions
    }

    /// The endpoint handle, for calling back to the peer.
    ///
    /// `None` under [`Binding::Functions`].
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// A context bound to nothing; for exercising handlers directly.
    pub(crate) fn detached() -> Self {
        Self {
            method: String::new(),
            meta: None,
            functions: Handlers::new(),
            endpoint: None,
        }
    }
}

/// A pending response-expecting call.
///
/// Dropping the record retires both the ack and response phases of the call
/// future, so clearing the table is all a terminal path has to do.
pub(crate) struct PendingCall {
    pub(crate) method: String,
    /// Call-site arguments, handed to the timeout handlers.
    pub(crate) args: Vec<Value>,
    pub(crate) acked: bool,
    pub(crate) response_tx: oneshot::Sender<Result<Value, CallError>>,
    pub(crate) ack_tx: Option<oneshot::Sender<()>>,
}

/// A live stream consumer registration.
pub(crate) struct StreamSlot {
    pub(crate) method: String,
    pub(crate) acked: bool,
    pub(crate) events_tx: mpsc::Sender<StreamEvent>,
    pub(crate) ack_tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) pending: HashMap<CallId, PendingCall>,
    pub(crate) streams: HashMap<CallId, StreamSlot>,
}

impl State {
    /// Draw an id unused by either table.
    fn fresh_id(&self) -> CallId {
        loop {
            let id = CallId::random();
            if !self.pending.contains_key(&id) && !self.streams.contains_key(&id) {
                return id;
            }
        }
    }
}

pub(crate) struct Shared {
    pub(crate) functions: Handlers,
    pub(crate) options: EndpointOptions,
    pub(crate) outbound_tx: mpsc::Sender<Frame>,
    pub(crate) state: Mutex<State>,
    pub(crate) closed: AtomicBool,
    pub(crate) shutdown: Notify,
}

/// One side of the RPC.
///
/// The handle is cheap to clone and usable from many tasks; the paired
/// [`Driver`] owns the transport and must be spawned.
///
/// ```ignore
/// let (endpoint, driver) = Endpoint::new(transport, functions, EndpointOptions::default());
/// tokio::spawn(driver.run());
/// let greeting = endpoint.call("hi", vec![json!("Alice")]).await?;
/// ```
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) shared: Arc<Shared>,
}

impl Endpoint {
    /// Create an endpoint over a transport.
    ///
    /// Calls issued before the driver is spawned enqueue and proceed once it
    /// runs.
    pub fn new<T: Transport>(
        transport: T,
        functions: Handlers,
        options: EndpointOptions,
    ) -> (Endpoint, Driver<T>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let endpoint = Endpoint {
            shared: Arc::new(Shared {
                functions,
                options,
                outbound_tx,
                state: Mutex::new(State::default()),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        };
        let driver = Driver::new(transport, endpoint.clone(), outbound_rx);
        (endpoint, driver)
    }

    // ========================================================================
    // Call surface
    // ========================================================================

    /// Call the peer's function at a dotted path and await its result.
    pub async fn call(&self, method: impl Into<String>, args: Vec<Value>) -> Result<Value, CallError> {
        self.call_raw(RawCall {
            method: method.into(),
            args,
            event: false,
            optional: false,
        })
        .await
    }

    /// As [`call`](Endpoint::call), but a missing remote function resolves to
    /// `Value::Null` instead of a not-found error.
    pub async fn call_optional(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        self.call_raw(RawCall {
            method: method.into(),
            args,
            event: false,
            optional: true,
        })
        .await
    }

    /// Fire-and-forget: resolves once the frame is handed to the driver.
    pub async fn call_event(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), CallError> {
        self.call_raw(RawCall {
            method: method.into(),
            args,
            event: true,
            optional: false,
        })
        .await
        .map(|_| ())
    }

    /// Call a function that streams its result.
    ///
    /// Lazy: the request is not sent until the first
    /// [`next`](CallStream::next).
    pub fn call_stream(&self, method: impl Into<String>, args: Vec<Value>) -> CallStream {
        CallStream::new(self.clone(), method.into(), args)
    }

    /// Explicit call form exposing all options.
    pub async fn call_raw(&self, call: RawCall) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::closed());
        }
        let RawCall {
            method,
            args,
            event,
            optional,
        } = call;
        if event || self.shared.options.event_methods.contains(&method) {
            trace!(method = %method, "posting event");
            let frame = Frame::Request {
                id: None,
                method,
                args,
                optional: false,
            };
            return self.absorb_general(self.post(frame).await.map(|_| Value::Null));
        }

        let request = CallRequest {
            method,
            args,
            optional,
        };
        let result = match self.shared.options.hook.clone() {
            Some(hook) => hook.on_call(request, Next::new(self.clone())).await,
            None => self.send_and_wait(request).await,
        };
        self.absorb_general(result)
    }

    /// Navigable builder for the peer's function tree.
    pub fn remote(&self, path: impl Into<String>) -> RemoteMethod {
        RemoteMethod::new(self.clone(), path.into())
    }

    /// The outbound path shared by direct calls and the hook's `next`.
    pub(crate) async fn send_and_wait(&self, request: CallRequest) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::closed());
        }
        let CallRequest {
            method,
            args,
            optional,
        } = request;

        let (response_tx, mut response_rx) = oneshot::channel();
        let ack_timeout = self.shared.options.ack_timeout;
        let (ack_tx, ack_rx) = match ack_timeout {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let id = {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.fresh_id();
            state.pending.insert(
                id,
                PendingCall {
                    method: method.clone(),
                    args: args.clone(),
                    acked: false,
                    response_tx,
                    ack_tx,
                },
            );
            id
        };
        debug!(id = %id, method = %method, "sending request");

        let frame = Frame::Request {
            id: Some(id),
            method: method.clone(),
            args,
            optional,
        };
        if let Err(err) = self.post(frame).await {
            self.shared.state.lock().unwrap().pending.remove(&id);
            return Err(err);
        }

        // Ack phase: armed only when an ack timeout is configured.
        if let (Some(limit), Some(mut ack_rx)) = (ack_timeout, ack_rx) {
            if tokio::time::timeout(limit, &mut ack_rx).await.is_err() {
                let record = self.shared.state.lock().unwrap().pending.remove(&id);
                if let Some(record) = record {
                    warn!(id = %id, method = %record.method, "ack timeout");
                    if self.consult_ack_timeout(&record.method, &record.args) {
                        return Ok(Value::Null);
                    }
                    return Err(CallError::AckTimeout {
                        method: record.method,
                    });
                }
                // A terminal outcome raced the timer; take it below.
            }
        }

        // Response phase: starts now, which is request-post time when no ack
        // timeout is configured and Ack-receipt time when one is.
        match self.shared.options.response_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut response_rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(CallError::closed()),
                Err(_) => {
                    let record = self.shared.state.lock().unwrap().pending.remove(&id);
                    match record {
                        Some(record) => {
                            warn!(id = %id, method = %record.method, "response timeout");
                            if let Some(on_timeout) = &self.shared.options.on_timeout {
                                if on_timeout(&record.method, &record.args) {
                                    return Ok(Value::Null);
                                }
                            }
                            Err(CallError::Timeout {
                                method: record.method,
                            })
                        }
                        // The response raced the timer and is already buffered.
                        None => match response_rx.try_recv() {
                            Ok(outcome) => outcome,
                            Err(_) => Err(CallError::closed()),
                        },
                    }
                }
            },
            None => match (&mut response_rx).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::closed()),
            },
        }
    }

    /// Hand a frame to the driver for transmission.
    pub(crate) async fn post(&self, frame: Frame) -> Result<(), CallError> {
        self.shared
            .outbound_tx
            .send(frame)
            .await
            .map_err(|_| CallError::closed())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The local function tree (readable and mutable at runtime).
    pub fn functions(&self) -> &Handlers {
        &self.shared.functions
    }

    /// Opaque metadata from the configuration.
    pub fn meta(&self) -> Option<&Value> {
        self.shared.options.meta.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ack_timeout(&self) -> Option<Duration> {
        self.shared.options.ack_timeout
    }

    // ========================================================================
    // Close / reject
    // ========================================================================

    /// Terminate the endpoint.
    ///
    /// Idempotent. Every pending call rejects, every live stream surfaces a
    /// terminal error, both tables empty, and the driver stops and drops the
    /// transport. Further calls fail synchronously.
    pub fn close(&self) {
        self.close_impl(None);
    }

    /// As [`close`](Endpoint::close), chaining `cause` on the errors handed
    /// to in-flight calls.
    pub fn close_with(&self, cause: impl StdError + Send + Sync + 'static) {
        self.close_impl(Some(Arc::new(cause)));
    }

    pub(crate) fn close_impl(&self, cause: Option<Arc<dyn StdError + Send + Sync>>) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing endpoint");
        let closed = CallError::Closed { cause };
        let (pending, streams) = {
            let mut state = self.shared.state.lock().unwrap();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.streams),
            )
        };
        for (id, record) in pending {
            trace!(id = %id, method = %record.method, "rejecting pending call on close");
            let _ = record.response_tx.send(Err(closed.clone()));
        }
        for (id, slot) in streams {
            trace!(id = %id, method = %slot.method, "failing stream on close");
            let _ = slot.events_tx.try_send(StreamEvent::Error(closed.clone()));
        }
        self.shared.shutdown.notify_one();
    }

    /// Fail every in-flight call with a default "rejected pending call"
    /// error, without closing the endpoint. Streams are not affected.
    pub fn reject_pending_calls(&self) {
        self.reject_pending_calls_with(|method| CallError::Rejected {
            method: method.to_string(),
        });
    }

    /// As [`reject_pending_calls`](Endpoint::reject_pending_calls), with the
    /// error produced per call from its method path.
    pub fn reject_pending_calls_with(&self, mut error_for: impl FnMut(&str) -> CallError) {
        let pending = std::mem::take(&mut self.shared.state.lock().unwrap().pending);
        for (id, record) in pending {
            trace!(id = %id, method = %record.method, "rejecting pending call");
            let err = error_for(&record.method);
            let _ = record.response_tx.send(Err(err));
        }
    }

    // ========================================================================
    // Inbound routing (called by the driver)
    // ========================================================================

    /// Build the invocation context for a request to `method`.
    pub(crate) fn context(&self, method: &str) -> Context {
        Context {
            method: method.to_string(),
            meta: self.shared.options.meta.clone(),
            functions: self.shared.functions.clone(),
            endpoint: match self.shared.options.binding {
                Binding::Endpoint => Some(self.clone()),
                Binding::Functions => None,
            },
        }
    }

    /// Deliver a terminal outcome to a pending call.
    ///
    /// Returns whether a record was there to receive it.
    pub(crate) fn complete_call(&self, id: CallId, outcome: Result<Value, CallError>) -> bool {
        let record = self.shared.state.lock().unwrap().pending.remove(&id);
        match record {
            Some(record) => {
                trace!(id = %id, method = %record.method, ok = outcome.is_ok(), "completing call");
                let _ = record.response_tx.send(outcome);
                true
            }
            None => {
                trace!(id = %id, "response for unknown call id");
                false
            }
        }
    }

    /// Record an Ack: the first one starts the response phase.
    pub(crate) fn observe_ack(&self, id: CallId) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(record) = state.pending.get_mut(&id) {
            if !record.acked {
                record.acked = true;
                if let Some(ack_tx) = record.ack_tx.take() {
                    let _ = ack_tx.send(());
                }
            }
            return;
        }
        if let Some(slot) = state.streams.get_mut(&id) {
            if !slot.acked {
                slot.acked = true;
                if let Some(ack_tx) = slot.ack_tx.take() {
                    let _ = ack_tx.send(());
                }
            }
            return;
        }
        trace!(id = %id, "ack for unknown call id");
    }

    /// Install a stream slot under a fresh id.
    pub(crate) fn register_stream(&self, slot: StreamSlot) -> CallId {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.fresh_id();
        state.streams.insert(id, slot);
        id
    }

    pub(crate) fn remove_stream(&self, id: CallId) -> Option<StreamSlot> {
        self.shared.state.lock().unwrap().streams.remove(&id)
    }

    /// The mailbox sender for a live stream, if any.
    pub(crate) fn stream_sender(&self, id: CallId) -> Option<mpsc::Sender<StreamEvent>> {
        self.shared
            .state
            .lock()
            .unwrap()
            .streams
            .get(&id)
            .map(|slot| slot.events_tx.clone())
    }

    // ========================================================================
    // Error channeling
    // ========================================================================

    /// Consult the ack-timeout handler; `true` suppresses the rejection.
    pub(crate) fn consult_ack_timeout(&self, method: &str, args: &[Value]) -> bool {
        self.shared
            .options
            .on_ack_timeout
            .as_ref()
            .is_some_and(|h| h(method, args))
    }

    /// Run a general error past the configured handler; unhandled ones are
    /// logged (there is no caller to raise them at).
    pub(crate) fn report_general_error(&self, err: &CallError) {
        let handled = self
            .shared
            .options
            .on_general_error
            .as_ref()
            .is_some_and(|h| h(err));
        if !handled {
            error!(error = %err, "unhandled rpc error");
        }
    }

    /// At a call boundary, give the general-error handler a chance to absorb
    /// transport/codec failures.
    fn absorb_general(&self, result: Result<Value, CallError>) -> Result<Value, CallError> {
        match result {
            Err(err) if err.is_general() => {
                match &self.shared.options.on_general_error {
                    Some(h) if h(&err) => Ok(Value::Null),
                    _ => Err(err),
                }
            }
            other => other,
        }
    }

    #[cfg(test)]
    pub(crate) fn table_sizes(&self) -> (usize, usize) {
        let state = self.shared.state.lock().unwrap();
        (state.pending.len(), state.streams.len())
    }
}
