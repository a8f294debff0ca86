#![deny(unsafe_code)]

//! Endpoint engine for the duet RPC protocol.
//!
//! duet is a symmetric, bidirectional RPC layer over any frame-passing
//! substrate: each side registers a local function namespace ([`Handlers`])
//! and calls the peer's through an [`Endpoint`]. The engine correlates
//! requests with responses, supports fire-and-forget events, optional
//! delivery acknowledgment with its own timer, streamed results, request
//! interception, and one-to-many broadcast over a [`Group`].
//!
//! Users should usually depend on the `duet` facade crate rather than this
//! one.

mod caller;
mod driver;
mod endpoint;
mod errors;
mod group;
mod handlers;
mod hook;
mod stream;
mod transport;

pub use caller::RemoteMethod;
pub use driver::Driver;
pub use endpoint::{
    Binding, Context, DEFAULT_RESPONSE_TIMEOUT, Endpoint, EndpointOptions, FunctionErrorHandler,
    GeneralErrorHandler, RawCall, Resolver, TimeoutHandler,
};
pub use errors::{CallError, ErrorKind, HandlerError, RemoteError};
pub use group::{Group, GroupChannel, GroupMethod};
pub use handlers::{
    Handler, HandlerFuture, Handlers, Reply, ValueStream, handler, stream_handler,
};
pub use hook::{CallHook, CallRequest, HookFuture, Next};
pub use stream::CallStream;
pub use transport::Transport;
