//! Generic tool server: a static registry of named tools dispatching
//! typed requests to handlers.
//!
//! Dispatch is strict: only registered names resolve, so no request can
//! reach a private helper by name. Parameters are validated against the
//! tool's spec before the handler runs, and every handler runs on the
//! blocking pool under a hard deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use atlas_core::error::{AtlasError, ErrorKind};

use crate::protocol::{ToolRequest, ToolResponse};

/// Default hard deadline per tool call.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Parameter value kinds accepted by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// JSON number (integer or float).
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl ParamKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: &'static str,
    /// Expected kind.
    pub kind: ParamKind,
    /// Whether the parameter must be present.
    pub required: bool,
}

impl ParamSpec {
    /// A required parameter.
    pub fn required(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind, required: true }
    }

    /// An optional parameter.
    pub fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind, required: false }
    }
}

/// JSON-schema-like input specification for one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Tool name as registered.
    pub name: &'static str,
    /// One-line description for listings.
    pub description: &'static str,
    /// Declared parameters.
    pub params: Vec<ParamSpec>,
}

impl ToolSpec {
    /// A spec with no parameters.
    pub fn nullary(name: &'static str, description: &'static str) -> Self {
        Self { name, description, params: Vec::new() }
    }

    /// Validate a params object against the declared parameters.
    fn validate(&self, params: &serde_json::Value) -> Result<(), String> {
        let object = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => {
                return if self.params.iter().any(|p| p.required) {
                    Err("params object is required".to_string())
                } else {
                    Ok(())
                };
            }
            _ => return Err("params must be an object".to_string()),
        };

        for spec in &self.params {
            match object.get(spec.name) {
                None | Some(serde_json::Value::Null) => {
                    if spec.required {
                        return Err(format!("missing required parameter: {}", spec.name));
                    }
                }
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(format!(
                            "parameter {} must be a {}",
                            spec.name,
                            spec.kind.as_str()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Boxed handler: params in, domain JSON out.
pub type Handler =
    Arc<dyn Fn(&serde_json::Value) -> Result<serde_json::Value, AtlasError> + Send + Sync>;

struct RegisteredTool {
    spec: ToolSpec,
    handler: Handler,
}

/// Registry-dispatched tool server.
pub struct ToolServer {
    tools: BTreeMap<&'static str, RegisteredTool>,
    deadline: Duration,
}

impl ToolServer {
    /// An empty server with the default deadline.
    pub fn new() -> Self {
        Self { tools: BTreeMap::new(), deadline: DEFAULT_DEADLINE }
    }

    /// Override the per-call deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Register a tool. Duplicate names are a construction bug.
    pub fn register<F>(&mut self, spec: ToolSpec, handler: F)
    where
        F: Fn(&serde_json::Value) -> Result<serde_json::Value, AtlasError>
            + Send
            + Sync
            + 'static,
    {
        let name = spec.name;
        let previous = self
            .tools
            .insert(name, RegisteredTool { spec, handler: Arc::new(handler) });
        assert!(previous.is_none(), "duplicate tool registration: {name}");
    }

    /// Registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// Registered tool specs, for the `tools` listing.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.tools.values().map(|t| &t.spec).collect()
    }

    /// Dispatch one parsed request.
    pub async fn dispatch(&self, request: ToolRequest) -> ToolResponse {
        let start = Instant::now();
        let id = request.id.clone();

        let Some(tool) = self.tools.get(request.tool.as_str()) else {
            return ToolResponse::failure(
                id,
                ErrorKind::UnknownTool,
                format!("unknown tool: {}", request.tool),
                start.elapsed().as_millis() as u64,
            );
        };

        if let Err(message) = tool.spec.validate(&request.params) {
            return ToolResponse::failure(
                id,
                ErrorKind::Validation,
                message,
                start.elapsed().as_millis() as u64,
            );
        }

        let handler = tool.handler.clone();
        let params = request.params.clone();
        let work = tokio::task::spawn_blocking(move || handler(&params));

        let outcome = match tokio::time::timeout(self.deadline, work).await {
            Err(_) => {
                tracing::warn!(tool = %request.tool, "handler exceeded deadline, dropping");
                return ToolResponse::failure(
                    id,
                    ErrorKind::Timeout,
                    format!("timed out after {}ms", self.deadline.as_millis()),
                    start.elapsed().as_millis() as u64,
                );
            }
            Ok(Err(join_err)) => Err(AtlasError::Internal(format!("handler panicked: {join_err}"))),
            Ok(Ok(result)) => result,
        };

        let timing_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(tool = %request.tool, ok = outcome.is_ok(), timing_ms, "tool dispatched");

        match outcome {
            Ok(result) => ToolResponse::success(id, result, timing_ms),
            Err(err) => ToolResponse::failure(id, err.kind(), err.to_string(), timing_ms),
        }
    }

    /// Parse one line and dispatch it. Parse failures frame an
    /// `error_type: "parse"` response preserving no id.
    pub async fn dispatch_line(&self, line: &str) -> ToolResponse {
        match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => ToolResponse::parse_failure(format!("invalid request frame: {e}")),
        }
    }
}

impl Default for ToolServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_server() -> ToolServer {
        let mut server = ToolServer::new();
        server.register(
            ToolSpec {
                name: "echo",
                description: "echo the message back",
                params: vec![
                    ParamSpec::required("message", ParamKind::String),
                    ParamSpec::optional("count", ParamKind::Integer),
                ],
            },
            |params| {
                Ok(serde_json::json!({
                    "echo": params["message"],
                    "count": params.get("count").cloned().unwrap_or(serde_json::json!(1)),
                }))
            },
        );
        server
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let server = echo_server();
        let resp = server
            .dispatch_line(r#"{"id":"a","tool":"echo","params":{"message":"hi"}}"#)
            .await;
        assert!(resp.ok);
        assert_eq!(resp.id.as_deref(), Some("a"));
        let result = resp.result.expect("result");
        assert_eq!(result["echo"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let server = echo_server();
        let resp = server.dispatch_line(r#"{"tool":"private_helper"}"#).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let server = echo_server();
        let resp = server.dispatch_line(r#"{"tool":"echo","params":{}}"#).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("validation"));
        assert!(resp.error.expect("error").contains("message"));
    }

    #[tokio::test]
    async fn test_wrong_param_kind() {
        let server = echo_server();
        let resp = server
            .dispatch_line(r#"{"tool":"echo","params":{"message":42}}"#)
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("validation"));
    }

    #[tokio::test]
    async fn test_parse_failure_preserves_no_id() {
        let server = echo_server();
        let resp = server.dispatch_line("{not json").await;
        assert!(!resp.ok);
        assert!(resp.id.is_none());
        assert_eq!(resp.error_type.as_deref(), Some("parse"));
    }

    #[tokio::test]
    async fn test_handler_error_maps_kind() {
        let mut server = ToolServer::new();
        server.register(ToolSpec::nullary("boom", "always fails"), |_| {
            Err(AtlasError::validation("nope"))
        });
        let resp = server.dispatch_line(r#"{"tool":"boom"}"#).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("validation"));
        assert_eq!(resp.error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let mut server = ToolServer::new().with_deadline(Duration::from_millis(50));
        server.register(ToolSpec::nullary("slow", "sleeps too long"), |_| {
            std::thread::sleep(Duration::from_secs(5));
            Ok(serde_json::json!({}))
        });
        let resp = server.dispatch_line(r#"{"tool":"slow"}"#).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("timeout"));
    }

    #[test]
    #[should_panic(expected = "duplicate tool registration")]
    fn test_duplicate_registration_panics() {
        let mut server = ToolServer::new();
        server.register(ToolSpec::nullary("t", "one"), |_| Ok(serde_json::json!({})));
        server.register(ToolSpec::nullary("t", "two"), |_| Ok(serde_json::json!({})));
    }
}
