use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator carried in wire error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The remote function raised while serving the request.
    Function,
    /// The method path did not resolve on the remote side.
    NotFound,
    /// Anything else, including foreign payload shapes.
    #[default]
    Other,
}

/// Structured error payload conveyed in a Response `e` field.
///
/// The engine produces this shape for its own errors; peers in other
/// implementations may send anything serializable, which decodes leniently
/// with the raw payload preserved in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    /// Payload for a handler that raised while serving `method`.
    pub fn function(method: &str, error: &HandlerError) -> Self {
        Self {
            kind: ErrorKind::Function,
            message: error.message.clone(),
            method: Some(method.to_string()),
            data: error.data.clone(),
        }
    }

    /// Payload for a method path that did not resolve.
    pub fn not_found(method: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: format!("function \"{method}\" not found"),
            method: Some(method.to_string()),
            data: None,
        }
    }

    /// Encode for the wire.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }

    /// Decode from the wire, accepting foreign payload shapes.
    pub fn from_value(value: Value) -> Self {
        if let Ok(decoded) = serde_json::from_value::<RemoteError>(value.clone()) {
            return decoded;
        }
        let message = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            kind: ErrorKind::Other,
            message,
            method: None,
            data: Some(value),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.method, self.kind) {
            (Some(method), ErrorKind::Function) => {
                write!(f, "error calling \"{method}\": {}", self.message)
            }
            _ => write!(f, "{}", self.message),
        }
    }
}

impl StdError for RemoteError {}

/// Error produced by a local handler.
///
/// The message and optional data travel to the caller inside the Response.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attach an arbitrary serializable payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for HandlerError {}

/// Error surfaced by the outbound call surface.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The peer reported an error (function raised, or path not found).
    Remote(RemoteError),
    /// The response timer fired.
    Timeout { method: String },
    /// The delivery-acknowledgment timer fired.
    AckTimeout { method: String },
    /// The call was drained by `reject_pending_calls`.
    Rejected { method: String },
    /// The endpoint is closed, or closed while the call was in flight.
    Closed {
        cause: Option<Arc<dyn StdError + Send + Sync>>,
    },
    /// The transport failed to ferry a frame.
    Transport(Arc<io::Error>),
    /// A frame failed to (de)serialize.
    Codec(Arc<serde_json::Error>),
}

impl CallError {
    /// A closed error with no underlying cause.
    pub fn closed() -> Self {
        CallError::Closed { cause: None }
    }

    /// A closed error chaining the given cause.
    pub fn closed_with(cause: impl StdError + Send + Sync + 'static) -> Self {
        CallError::Closed {
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CallError::Closed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    /// True when the peer reported that the method path did not resolve.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CallError::Remote(e) if e.kind == ErrorKind::NotFound)
    }

    /// True for the general-error class (transport and codec failures).
    pub(crate) fn is_general(&self) -> bool {
        matches!(self, CallError::Transport(_) | CallError::Codec(_))
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Remote(e) => write!(f, "{e}"),
            CallError::Timeout { method } => write!(f, "timeout on calling \"{method}\""),
            CallError::AckTimeout { method } => write!(f, "ack timeout on calling \"{method}\""),
            CallError::Rejected { method } => write!(f, "rejected pending call \"{method}\""),
            CallError::Closed { .. } => write!(f, "endpoint is closed"),
            CallError::Transport(e) => write!(f, "transport error: {e}"),
            CallError::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl StdError for CallError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CallError::Remote(e) => Some(e),
            CallError::Closed { cause } => cause
                .as_ref()
                .map(|c| &**c as &(dyn StdError + 'static)),
            CallError::Transport(e) => Some(&**e),
            CallError::Codec(e) => Some(&**e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_messages_name_the_method() {
        let timeout = CallError::Timeout {
            method: "slow".to_string(),
        };
        let ack = CallError::AckTimeout {
            method: "slow".to_string(),
        };
        assert_eq!(timeout.to_string(), "timeout on calling \"slow\"");
        assert_eq!(ack.to_string(), "ack timeout on calling \"slow\"");
        // A plain timeout must not read as an ack timeout.
        assert!(!timeout.to_string().contains("ack timeout"));
    }

    #[test]
    fn not_found_payload_round_trips() {
        let payload = RemoteError::not_found("user.get");
        let value = payload.to_value();
        let decoded = RemoteError::from_value(value);
        assert_eq!(decoded, payload);
        assert!(decoded.message.contains("function \"user.get\" not found"));
        assert!(CallError::Remote(decoded).is_not_found());
    }

    #[test]
    fn foreign_error_payloads_decode_leniently() {
        let decoded = RemoteError::from_value(json!(["weird", 1]));
        assert_eq!(decoded.kind, ErrorKind::Other);
        assert_eq!(decoded.data, Some(json!(["weird", 1])));

        let decoded = RemoteError::from_value(json!("just a string"));
        assert_eq!(decoded.message, "just a string");
    }

    #[test]
    fn closed_error_chains_its_cause() {
        let cause = io::Error::other("socket fell over");
        let err = CallError::closed_with(cause);
        assert_eq!(err.to_string(), "endpoint is closed");
        let source = err.source().expect("cause should be chained");
        assert_eq!(source.to_string(), "socket fell over");
    }

    #[test]
    fn function_payload_carries_handler_data() {
        let handler_err = HandlerError::new("boom").with_data(json!({ "code": 3 }));
        let payload = RemoteError::function("math.div", &handler_err);
        assert_eq!(payload.kind, ErrorKind::Function);
        assert_eq!(payload.method.as_deref(), Some("math.div"));
        assert_eq!(payload.data, Some(json!({ "code": 3 })));
        assert_eq!(
            payload.to_string(),
            "error calling \"math.div\": boom"
        );
    }
}
