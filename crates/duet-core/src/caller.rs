//! Navigable handle onto the peer's function tree.
//!
//! Every prefix of a dotted path is itself navigable, so a handle can be
//! built up segment by segment and invoked as a call, an event, or a stream:
//!
//! ```ignore
//! let get = endpoint.remote("user").join("settings").join("get");
//! let theme = get.call(vec![json!("theme")]).await?;
//! endpoint.remote("log").event(vec![json!("hello")]).await?;
//! ```

use serde_json::Value;

use crate::endpoint::{Endpoint, RawCall};
use crate::errors::CallError;
use crate::stream::CallStream;

/// A remote method path bound to an endpoint.
#[derive(Clone)]
pub struct RemoteMethod {
    endpoint: Endpoint,
    path: String,
}

impl RemoteMethod {
    pub(crate) fn new(endpoint: Endpoint, path: String) -> Self {
        Self { endpoint, path }
    }

    /// The dotted path accumulated so far.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Descend one segment.
    pub fn join(&self, segment: impl AsRef<str>) -> RemoteMethod {
        RemoteMethod {
            endpoint: self.endpoint.clone(),
            path: format!("{}.{}", self.path, segment.as_ref()),
        }
    }

    /// Invoke as a response-expecting call.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.endpoint.call(self.path.clone(), args).await
    }

    /// Invoke tolerating a missing remote function.
    pub async fn call_optional(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.endpoint.call_optional(self.path.clone(), args).await
    }

    /// Invoke fire-and-forget.
    pub async fn event(&self, args: Vec<Value>) -> Result<(), CallError> {
        self.endpoint.call_event(self.path.clone(), args).await
    }

    /// Invoke as a streamed call.
    pub fn stream(&self, args: Vec<Value>) -> CallStream {
        self.endpoint.call_stream(self.path.clone(), args)
    }

    /// Invoke with explicit options, keeping this handle's path.
    pub async fn raw(&self, args: Vec<Value>, event: bool, optional: bool) -> Result<Value, CallError> {
        self.endpoint
            .call_raw(RawCall {
                method: self.path.clone(),
                args,
                event,
                optional,
            })
            .await
    }
}
