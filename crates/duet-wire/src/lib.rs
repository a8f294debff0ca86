#![deny(unsafe_code)]

//! Wire-level frame types for the duet RPC protocol.
//!
//! A frame is a tagged record with a single-letter tag `t` and, when the
//! frame is correlated with a call, an id field `i`. Serialization is a
//! transport concern: frame-level transports move [`Frame`] values as-is,
//! byte-level transports go through [`codec`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;

/// Identifier correlating requests with responses and stream frames.
///
/// Ids are drawn at random (64 bits of entropy) by the caller and are never
/// reused while a correlation or stream record is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl CallId {
    /// Create a call id from a raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draw a random call id.
    ///
    /// Callers must re-draw while the id collides with a live record.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<CallId> for u64 {
    fn from(id: CallId) -> Self {
        id.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

/// Protocol frame.
///
/// The tag letters and field names are wire-significant; optional fields are
/// omitted entirely when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Frame {
    /// A call to the peer's function tree.
    ///
    /// Without `i` the request is fire-and-forget: the receiver invokes the
    /// function but must not emit Ack, Response, or stream frames for it.
    #[serde(rename = "q")]
    Request {
        #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
        id: Option<CallId>,
        /// Dot-separated path into the receiver's function tree.
        #[serde(rename = "m")]
        method: String,
        #[serde(rename = "a", default)]
        args: Vec<Value>,
        /// When set, a missing function resolves to null instead of an error.
        #[serde(rename = "o", default, skip_serializing_if = "is_false")]
        optional: bool,
    },

    /// Terminal answer to a [`Frame::Request`] bearing an id.
    ///
    /// Exactly one of `result` and `error` is populated.
    #[serde(rename = "s")]
    Response {
        #[serde(rename = "i")]
        id: CallId,
        #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },

    /// Receipt confirmation, sent before the function is invoked.
    #[serde(rename = "a")]
    Ack {
        #[serde(rename = "i")]
        id: CallId,
    },

    /// One value of a streamed result.
    #[serde(rename = "n")]
    StreamNext {
        #[serde(rename = "i")]
        id: CallId,
        #[serde(rename = "v")]
        value: Value,
    },

    /// Normal completion of a streamed result.
    #[serde(rename = "d")]
    StreamEnd {
        #[serde(rename = "i")]
        id: CallId,
    },

    /// Abnormal completion of a streamed result.
    #[serde(rename = "x")]
    StreamError {
        #[serde(rename = "i")]
        id: CallId,
        #[serde(rename = "e")]
        error: Value,
    },
}

impl Frame {
    /// The correlation id, if this frame carries one.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Frame::Request { id, .. } => *id,
            Frame::Response { id, .. }
            | Frame::Ack { id }
            | Frame::StreamNext { id, .. }
            | Frame::StreamEnd { id }
            | Frame::StreamError { id, .. } => Some(*id),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_without_id_omits_correlation_fields() {
        let frame = Frame::Request {
            id: None,
            method: "bump".to_string(),
            args: vec![],
            optional: false,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({ "t": "q", "m": "bump", "a": [] }));
    }

    #[test]
    fn request_with_id_and_optional_flag_round_trips() {
        let frame = Frame::Request {
            id: Some(CallId::new(7)),
            method: "user.settings.get".to_string(),
            args: vec![json!("theme")],
            optional: true,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({ "t": "q", "i": 7, "m": "user.settings.get", "a": ["theme"], "o": true })
        );
        let decoded: Frame = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn response_round_trips_both_arms() {
        let ok = Frame::Response {
            id: CallId::new(1),
            result: Some(json!("hi")),
            error: None,
        };
        let err = Frame::Response {
            id: CallId::new(2),
            result: None,
            error: Some(json!({ "message": "boom" })),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "t": "s", "i": 1, "r": "hi" })
        );
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({ "t": "s", "i": 2, "e": { "message": "boom" } })
        );
    }

    #[test]
    fn stream_frames_round_trip() {
        for frame in [
            Frame::Ack { id: CallId::new(9) },
            Frame::StreamNext {
                id: CallId::new(9),
                value: json!(42),
            },
            Frame::StreamEnd { id: CallId::new(9) },
            Frame::StreamError {
                id: CallId::new(9),
                error: json!("bad"),
            },
        ] {
            let value = serde_json::to_value(&frame).unwrap();
            let decoded: Frame = serde_json::from_value(value).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn request_missing_args_defaults_to_empty() {
        let decoded: Frame = serde_json::from_value(json!({ "t": "q", "m": "ping" })).unwrap();
        assert_eq!(
            decoded,
            Frame::Request {
                id: None,
                method: "ping".to_string(),
                args: vec![],
                optional: false,
            }
        );
    }

    #[test]
    fn call_id_display_and_conversions() {
        let id = CallId::from(12u64);
        assert_eq!(id.to_string(), "call:12");
        assert_eq!(u64::from(id), 12);
    }
}
