#![deny(unsafe_code)]

//! duet - symmetric, transport-agnostic, bidirectional RPC.
//!
//! Both sides of a connection register a local function namespace and obtain
//! a handle to call the peer's. The engine sits atop any frame-passing
//! substrate and adds request/response correlation, fire-and-forget events,
//! optional delivery acknowledgment, streamed results with independent
//! timeouts, request interception, and one-to-many broadcast.
//!
//! Users should depend on this crate rather than the individual component
//! crates.
//!
//! ```ignore
//! use duet::prelude::*;
//! use duet_memory::memory_pair;
//! use serde_json::json;
//!
//! let functions = Handlers::new();
//! functions.insert("hi", handler(|_ctx, args| async move {
//!     Ok(json!(format!("Hi {}!", args[0].as_str().unwrap_or("?"))))
//! }));
//!
//! let (a, b) = memory_pair(256);
//! let (bob, bob_driver) = Endpoint::new(a, functions, EndpointOptions::default());
//! let (alice, alice_driver) = Endpoint::new(b, Handlers::new(), EndpointOptions::default());
//! tokio::spawn(bob_driver.run());
//! tokio::spawn(alice_driver.run());
//!
//! let greeting = alice.call("hi", vec![json!("Alice")]).await?;
//! ```

// Engine surface.
pub use duet_core::{
    Binding, CallError, CallHook, CallRequest, CallStream, Context, DEFAULT_RESPONSE_TIMEOUT,
    Driver, Endpoint, EndpointOptions, ErrorKind, Group, GroupChannel, GroupMethod, Handler,
    HandlerError, HandlerFuture, Handlers, HookFuture, Next, RawCall, RemoteError, RemoteMethod,
    Reply, Transport, ValueStream, handler, stream_handler,
};

// Wire-level types for transport implementations.
pub use duet_wire as wire;
pub use duet_wire::{CallId, Frame};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use duet::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CallError, Endpoint, EndpointOptions, HandlerError, Handlers, handler, stream_handler,
    };
}
