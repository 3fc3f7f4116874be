//! Wire frame protocol.
//!
//! All peer traffic is JSON text frames over a framed bidirectional
//! transport (WebSocket in the reference node). Three frame shapes:
//! requests, responses, and fire-and-forget events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::MeshError;

/// Maximum serialized frame size: 10 MiB.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// A protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame {
    /// A request expecting exactly one response with the same `id`.
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// The response to a request.
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MeshError>,
    },
    /// A one-way event; no response expected.
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl WireFrame {
    /// Build a request frame with a fresh id.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        WireFrame::Req {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    /// Build a success response for a request id.
    pub fn ok_response(id: impl Into<String>, payload: Value) -> Self {
        WireFrame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Build an error response for a request id.
    pub fn err_response(id: impl Into<String>, error: MeshError) -> Self {
        WireFrame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Build an event frame.
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        WireFrame::Event {
            event: event.into(),
            payload,
        }
    }
}

/// Frame codec failures. Distinct from [`MeshError`]: these never cross
/// the wire, they kill the offending connection.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Serialize a frame to its wire text. Refuses frames over the size cap.
pub fn encode_frame(frame: &WireFrame) -> Result<String, WireError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(text)
}

/// Parse a wire text into a frame. Refuses oversized input before parsing.
pub fn decode_frame(text: &str) -> Result<WireFrame, WireError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let frame = WireFrame::request("mesh.peers", json!({}));
        let text = encode_frame(&frame).unwrap();
        assert!(text.contains("\"type\":\"req\""));
        let decoded = decode_frame(&text).unwrap();
        match decoded {
            WireFrame::Req { method, .. } => assert_eq!(method, "mesh.peers"),
            other => panic!("expected req, got {other:?}"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let frame = WireFrame::err_response("abc", MeshError::new(ErrorCode::LoopDetected, "origin is self"));
        let text = encode_frame(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "res");
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "LOOP_DETECTED");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_event_roundtrip() {
        let frame = WireFrame::event("context.frame", json!({"kind": "observation"}));
        let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        match decoded {
            WireFrame::Event { event, payload } => {
                assert_eq!(event, "context.frame");
                assert_eq!(payload["kind"], "observation");
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = "x".repeat(MAX_FRAME_BYTES + 1);
        let frame = WireFrame::event("blob", json!(big));
        assert!(matches!(
            encode_frame(&frame),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_params_defaults_to_null() {
        let decoded = decode_frame(r#"{"type":"req","id":"1","method":"mesh.status"}"#).unwrap();
        match decoded {
            WireFrame::Req { params, .. } => assert!(params.is_null()),
            other => panic!("expected req, got {other:?}"),
        }
    }
}
