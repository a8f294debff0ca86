//! JSON (de)coding for byte-level transports.
//!
//! Frame-level transports (in-process channels) carry [`Frame`] values
//! directly and never touch this module. Byte-level transports encode each
//! frame as one JSON object.
//!
//! Decoding is tolerant of unknown tags: a well-formed envelope whose `t`
//! field names no known frame kind decodes to `None` and is ignored by the
//! receiver, so a newer peer can emit frame kinds an older peer skips.

use serde::de::Error as _;
use serde_json::Value;

use crate::Frame;

const KNOWN_TAGS: [&str; 6] = ["q", "s", "a", "n", "d", "x"];

/// Encode a frame to JSON bytes.
pub fn encode_frame(frame: &Frame) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(frame)
}

/// Decode a frame from JSON bytes.
///
/// Returns `Ok(None)` for an envelope with an unrecognized tag.
pub fn decode_frame(bytes: &[u8]) -> serde_json::Result<Option<Frame>> {
    frame_from_value(serde_json::from_slice(bytes)?)
}

/// Encode a frame to a JSON value (for transports that move values).
pub fn frame_to_value(frame: &Frame) -> serde_json::Result<Value> {
    serde_json::to_value(frame)
}

/// Decode a frame from a JSON value.
///
/// Returns `Ok(None)` for an envelope with an unrecognized tag and an error
/// for anything that is not a tagged object.
pub fn frame_from_value(value: Value) -> serde_json::Result<Option<Frame>> {
    match value.get("t").and_then(Value::as_str) {
        Some(tag) if KNOWN_TAGS.contains(&tag) => serde_json::from_value(value).map(Some),
        Some(_) => Ok(None),
        None => Err(serde_json::Error::custom("frame has no tag field")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallId;
    use serde_json::json;

    #[test]
    fn bytes_round_trip() {
        let frame = Frame::StreamNext {
            id: CallId::new(3),
            value: json!({ "n": 1 }),
        };
        let bytes = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn unknown_tag_is_skipped_not_fatal() {
        let decoded = frame_from_value(json!({ "t": "z", "i": 1 })).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn missing_tag_is_an_error() {
        assert!(frame_from_value(json!({ "i": 1 })).is_err());
        assert!(frame_from_value(json!(17)).is_err());
    }

    #[test]
    fn malformed_known_tag_is_an_error() {
        // Right tag, wrong field types.
        assert!(frame_from_value(json!({ "t": "s", "i": "not-a-number" })).is_err());
    }
}
