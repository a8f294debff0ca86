//! Interception of outbound calls.
//!
//! A [`CallHook`] sees every response-expecting call before it is sent and
//! must do exactly one of:
//! - await `next.run(request)` (optionally with a modified request) and
//!   propagate its result,
//! - return a synthetic `Ok` without running `next` — nothing is sent, no
//!   record is installed, no timer is armed,
//! - return an `Err`, which the general-error handler is consulted about at
//!   the call boundary.
//!
//! Events and streamed calls bypass the hook.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::errors::CallError;

/// An outbound request as seen by the hook.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub method: String,
    pub args: Vec<Value>,
    pub optional: bool,
}

/// Continuation that sends the request and awaits the peer's response.
pub struct Next {
    endpoint: Endpoint,
}

impl Next {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Send the (possibly modified) request and await its outcome.
    pub async fn run(self, request: CallRequest) -> Result<Value, CallError> {
        self.endpoint.send_and_wait(request).await
    }
}

/// Hook applied to outbound response-expecting calls.
///
/// ```ignore
/// struct Stamp;
///
/// impl CallHook for Stamp {
///     fn on_call(&self, mut request: CallRequest, next: Next) -> HookFuture<'_> {
///         Box::pin(async move {
///             request.args.push(json!("stamped"));
///             next.run(request).await
///         })
///     }
/// }
/// ```
pub trait CallHook: Send + Sync {
    fn on_call(&self, request: CallRequest, next: Next) -> HookFuture<'_>;
}

/// Boxed future returned by [`CallHook::on_call`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>>;
