//! Wire frames for the tool protocol.
//!
//! One request shape and one response shape, carried as newline-
//! delimited JSON over stdio and as the POST body over HTTP. The `id`
//! field, when present, is echoed back verbatim so callers can
//! correlate responses.

use serde::{Deserialize, Serialize};

use atlas_core::error::ErrorKind;

/// A request frame: `{"id"?, "tool", "params"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Caller-assigned correlation id, echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Registered tool name.
    pub tool: String,
    /// Tool parameters; an object, defaulting to `{}`.
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A response frame: `{"id"?, "ok", "result"|"error", "error_type",
/// "timing_ms"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Correlation id from the request, when it carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether the call succeeded.
    pub ok: bool,
    /// The tool result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message on failure. Messages, never stack traces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error category on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Handler wall time in milliseconds.
    pub timing_ms: u64,
}

impl ToolResponse {
    /// A success frame.
    pub fn success(id: Option<String>, result: serde_json::Value, timing_ms: u64) -> Self {
        Self { id, ok: true, result: Some(result), error: None, error_type: None, timing_ms }
    }

    /// A failure frame with a stable category.
    pub fn failure(
        id: Option<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        timing_ms: u64,
    ) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(message.into()),
            error_type: Some(kind.as_str().to_string()),
            timing_ms,
        }
    }

    /// The frame for an unparsable request. No id is preserved because
    /// none could be read.
    pub fn parse_failure(message: impl Into<String>) -> Self {
        Self::failure(None, ErrorKind::Parse, message, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_params() {
        let req: ToolRequest =
            serde_json::from_str(r#"{"tool":"lookup"}"#).expect("parse");
        assert_eq!(req.tool, "lookup");
        assert!(req.id.is_none());
        assert!(req.params.is_object());
    }

    #[test]
    fn test_request_preserves_id() {
        let req: ToolRequest =
            serde_json::from_str(r#"{"id":"r1","tool":"count","params":{"model":"User"}}"#)
                .expect("parse");
        assert_eq!(req.id.as_deref(), Some("r1"));
        assert_eq!(req.params["model"], "User");
    }

    #[test]
    fn test_success_frame_shape() {
        let resp = ToolResponse::success(Some("r1".into()), serde_json::json!({"n": 1}), 12);
        let json = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(json["id"], "r1");
        assert_eq!(json["ok"], true);
        assert_eq!(json["result"]["n"], 1);
        assert!(json.get("error").is_none());
        assert_eq!(json["timing_ms"], 12);
    }

    #[test]
    fn test_failure_frame_shape() {
        let resp =
            ToolResponse::failure(None, ErrorKind::UnknownTool, "unknown tool: nope", 1);
        let json = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error_type"], "unknown_tool");
        assert!(json.get("id").is_none());
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_parse_failure_has_no_id() {
        let resp = ToolResponse::parse_failure("bad json");
        assert!(resp.id.is_none());
        assert_eq!(resp.error_type.as_deref(), Some("parse"));
        assert!(!resp.ok);
    }
}
