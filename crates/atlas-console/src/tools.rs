//! Tiered console tool registrations.
//!
//! Every tool flows through the same safety pipeline: registry
//! validation, confirmation (where required), the adapter call inside
//! its rolled-back transaction, column redaction, and an audit entry.
//! The tool-name set is closed; nothing outside these tiers is
//! reachable.

use std::sync::Arc;

use atlas_core::error::{AtlasError, AtlasResult};
use atlas_server::protocol::{ToolRequest, ToolResponse};
use atlas_server::server::{ParamKind, ParamSpec, ToolServer, ToolSpec};

use crate::adapter::LiveAdapter;
use crate::registry::ModelRegistry;
use crate::safety::{redact_value, AuditLogger, Confirmation};
use crate::sql::SqlValidator;

/// Maximum per-call timeout for `eval`, in seconds.
const EVAL_TIMEOUT_CAP_SECS: u64 = 30;

/// Tier 1: read-only primitives.
const TIER1: &[(&str, &str)] = &[
    ("count", "Row count for a model"),
    ("sample", "Random rows from a model (limit capped at 25)"),
    ("find", "Fetch one record by primary key or unique column"),
    ("pluck", "Select specific columns (limit capped at 1000)"),
    ("aggregate", "sum/average/minimum/maximum over a column"),
    ("association_count", "Count records of one association"),
    ("schema", "Columns and optional indexes for a model"),
    ("recent", "Latest rows ordered by a column (limit capped at 50)"),
    ("status", "Adapter name and known models"),
];

/// Tier 2: domain-aware composites.
const TIER2: &[(&str, &str)] = &[
    ("diagnose_model", "Count, recent rows, and aggregates for a model"),
    ("data_snapshot", "A record with its associations to depth 3"),
    ("validate_record", "Run model validations against a record"),
    ("check_setting", "Read an application setting"),
    ("update_setting", "Change an application setting (confirmed)"),
    ("check_policy", "Evaluate an authorization policy"),
    ("validate_with", "Run a named validator against a record"),
    ("check_eligibility", "Evaluate an eligibility rule"),
    ("decorate", "Render a record through its decorator"),
];

/// Tier 3: operational / analytics.
const TIER3: &[(&str, &str)] = &[
    ("slow_endpoints", "Slowest endpoints from runtime metrics"),
    ("error_rates", "Error rates from runtime metrics"),
    ("throughput", "Request throughput from runtime metrics"),
    ("job_queues", "Background job queue depths"),
    ("job_failures", "Recent background job failures"),
    ("job_find", "Inspect a background job (retry confirmed)"),
    ("job_schedule", "Scheduled background jobs"),
    ("redis_info", "Redis server statistics"),
    ("cache_stats", "Cache hit/miss statistics"),
    ("channel_status", "Websocket channel subscriptions"),
];

/// Tools that always require confirmation.
const ALWAYS_CONFIRM: &[&str] = &["update_setting", "eval"];

/// Shared console state.
pub struct ConsoleState {
    /// The live-application adapter.
    pub adapter: Arc<dyn LiveAdapter>,
    /// Model/column/association registry from the extracted metadata.
    pub registry: Arc<ModelRegistry>,
    /// Confirmation gate for mutating and escape-hatch tools.
    pub confirmation: Arc<Confirmation>,
    /// Audit appender.
    pub audit: Arc<AuditLogger>,
    /// Free-SQL validator.
    pub sql_validator: Arc<SqlValidator>,
    /// Column names replaced by `[REDACTED]` in results.
    pub redacted_columns: Vec<String>,
}

impl ConsoleState {
    /// Run one tool through the full safety pipeline.
    fn invoke(
        &self,
        tool: &str,
        params: &serde_json::Value,
        needs_confirmation: bool,
    ) -> AtlasResult<serde_json::Value> {
        // Model names validate server-side before any query text exists,
        // in bridge mode as well as embedded.
        if let Some(model) = params.get("model").and_then(|v| v.as_str()) {
            self.registry.validate_model(model)?;
        }

        if needs_confirmation {
            if let Err(err) = self.confirmation.confirm(tool, params) {
                self.audit.log(tool, params, false, "denied")?;
                return Err(err);
            }
        }

        let request = ToolRequest {
            id: None,
            tool: tool.to_string(),
            params: params.clone(),
        };
        let response = self.adapter.send_request(&request);

        if response.ok {
            let mut result = response.result.unwrap_or(serde_json::Value::Null);
            redact_value(&mut result, &self.redacted_columns);
            self.audit.log(tool, params, true, &summarize(&result))?;
            Ok(result)
        } else {
            let err = error_from_frame(&response);
            self.audit
                .log(tool, params, needs_confirmation, &format!("error: {err}"))?;
            Err(err)
        }
    }
}

/// Reconstruct a typed error from a response frame.
fn error_from_frame(response: &ToolResponse) -> AtlasError {
    let message = response.error.clone().unwrap_or_else(|| "unknown error".to_string());
    match response.error_type.as_deref() {
        Some("validation") => AtlasError::Validation { message },
        Some("unsupported") => AtlasError::Unsupported {
            operation: message.strip_prefix("unsupported: ").unwrap_or(&message).to_string(),
        },
        Some("sql_rejected") => AtlasError::SqlRejected {
            reason: message.strip_prefix("Rejected: ").unwrap_or(&message).to_string(),
        },
        Some("timeout") => AtlasError::Timeout { ms: 0 },
        Some("confirmation_denied") => AtlasError::ConfirmationDenied { tool: message },
        _ => AtlasError::Internal(message),
    }
}

/// Short audit summary of a result.
fn summarize(result: &serde_json::Value) -> String {
    if let Some(rows) = result.get("rows").or_else(|| result.get("records")).and_then(|v| v.as_array()) {
        format!("ok ({} rows)", rows.len())
    } else if let Some(count) = result.get("count") {
        format!("ok (count {count})")
    } else {
        "ok".to_string()
    }
}

/// Build the console tool server over the given state.
pub fn build_console_server(state: &Arc<ConsoleState>) -> ToolServer {
    let mut server = ToolServer::new();

    // Tiers 1-3: forwarded through the pipeline; confirmation only for
    // the tools that mutate.
    for &(name, description) in TIER1.iter().chain(TIER2).chain(TIER3) {
        let s = state.clone();
        let tool: &'static str = name;
        server.register(
            ToolSpec { name, description, params: Vec::new() },
            move |params| {
                let confirm = ALWAYS_CONFIRM.contains(&tool)
                    || (tool == "job_find"
                        && params.get("retry").and_then(|v| v.as_bool()).unwrap_or(false));
                s.invoke(tool, params, confirm)
            },
        );
    }

    // eval: escape hatch, always confirmed, timeout clamped.
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "eval",
            description: "Evaluate an expression in the application (confirmed, timeout capped)",
            params: vec![
                ParamSpec::required("code", ParamKind::String),
                ParamSpec::optional("timeout_secs", ParamKind::Integer),
            ],
        },
        move |params| {
            let mut params = params.clone();
            let timeout = params
                .get("timeout_secs")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(EVAL_TIMEOUT_CAP_SECS)
                .min(EVAL_TIMEOUT_CAP_SECS);
            params["timeout_secs"] = serde_json::json!(timeout);
            s.invoke("eval", &params, true)
        },
    );

    // sql: free SQL through the validator, then the rolled-back context.
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "sql",
            description: "Run validated read-only SQL (SELECT/WITH/EXPLAIN only)",
            params: vec![
                ParamSpec::required("sql", ParamKind::String),
                ParamSpec::optional("limit", ParamKind::Integer),
            ],
        },
        move |params| {
            let sql = params
                .get("sql")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AtlasError::validation("missing required parameter: sql"))?;
            if let Err(err) = s.sql_validator.validate(sql) {
                s.audit.log("sql", params, false, &format!("rejected: {err}"))?;
                return Err(err);
            }
            s.invoke("sql", params, false)
        },
    );

    // query: the enhanced builder; column validation happens in the
    // adapter where the SQL is assembled.
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "query",
            description: "Structured query builder over one model",
            params: vec![
                ParamSpec::required("model", ParamKind::String),
                ParamSpec::optional("select", ParamKind::Array),
                ParamSpec::optional("joins", ParamKind::Array),
                ParamSpec::optional("group_by", ParamKind::String),
                ParamSpec::optional("having", ParamKind::String),
                ParamSpec::optional("order", ParamKind::String),
                ParamSpec::optional("limit", ParamKind::Integer),
            ],
        },
        move |params| s.invoke("query", params, false),
    );

    // confirmation_history: operator visibility into the gate.
    let s = state.clone();
    server.register(
        ToolSpec::nullary("confirmation_history", "Decisions made by the confirmation gate"),
        move |_| {
            let history = s.confirmation.history();
            serde_json::to_value(&history)
                .map_err(|e| AtlasError::Serialization(e.to_string()))
        },
    );

    tracing::info!(tools = server.tool_names().len(), "console server built");
    server
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EmbeddedAdapter;
    use crate::registry::ModelInfo;
    use crate::safety::{Confirmation, ConfirmationMode, Dialect, SafeContext};
    use parking_lot::Mutex;
    use rusqlite::Connection;

    fn console(mode: ConfirmationMode) -> (tempfile::TempDir, Arc<ConsoleState>, ToolServer) {
        let dir = tempfile::tempdir().expect("create temp dir");

        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, encrypted_password TEXT);
             INSERT INTO users (email, encrypted_password) VALUES ('a@example.com', 'hunter2');",
        )
        .expect("seed");

        let mut registry = ModelRegistry::new();
        registry.insert(
            "User",
            ModelInfo {
                table: "users".into(),
                primary_key: "id".into(),
                columns: vec!["id".into(), "email".into(), "encrypted_password".into()],
                associations: Default::default(),
            },
        );
        let registry = Arc::new(registry);

        let safe =
            SafeContext::new(Arc::new(Mutex::new(conn)), Dialect::Sqlite, 5000);
        let adapter = Arc::new(EmbeddedAdapter::new(safe, registry.clone()));

        let state = Arc::new(ConsoleState {
            adapter,
            registry,
            confirmation: Arc::new(Confirmation::new(mode)),
            audit: Arc::new(AuditLogger::new(dir.path().join("audit.jsonl"))),
            sql_validator: Arc::new(SqlValidator::new()),
            redacted_columns: vec!["encrypted_password".into()],
        });
        let server = build_console_server(&state);
        (dir, state, server)
    }

    #[tokio::test]
    async fn test_count_happy_path_audited() {
        let (_dir, state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server
            .dispatch_line(r#"{"id":"r1","tool":"count","params":{"model":"User"}}"#)
            .await;
        assert!(resp.ok);
        assert_eq!(resp.result.expect("result")["count"], 1);

        let entries = state.audit.read_all().expect("audit");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool, "count");
        assert!(entries[0].confirmed);
    }

    #[tokio::test]
    async fn test_unknown_model_scenario() {
        let (_dir, _state, server) = console(ConfirmationMode::AutoDeny);
        // Registry holds only User, so the message lists it alone.
        let resp = server
            .dispatch_line(r#"{"id":"r1","tool":"count","params":{"model":"Hacker"}}"#)
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.id.as_deref(), Some("r1"));
        assert_eq!(resp.error_type.as_deref(), Some("validation"));
        assert_eq!(resp.error.as_deref(), Some("Unknown model: Hacker. Available: User"));
    }

    #[tokio::test]
    async fn test_sql_multi_statement_scenario() {
        let (_dir, _state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server
            .dispatch_line(r#"{"tool":"sql","params":{"sql":"SELECT 1; DROP TABLE users"}}"#)
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("sql_rejected"));
        assert_eq!(
            resp.error.as_deref(),
            Some("Rejected: multiple statements are not allowed")
        );
    }

    #[tokio::test]
    async fn test_sql_select_passes_and_redacts() {
        let (_dir, _state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server
            .dispatch_line(r#"{"tool":"sql","params":{"sql":"SELECT * FROM users"}}"#)
            .await;
        assert!(resp.ok, "error: {:?}", resp.error);
        let rows = resp.result.expect("result")["rows"].clone();
        assert_eq!(rows[0]["email"], "a@example.com");
        assert_eq!(rows[0]["encrypted_password"], "[REDACTED]");
    }

    #[tokio::test]
    async fn test_eval_denied_by_default() {
        let (_dir, state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server
            .dispatch_line(r#"{"tool":"eval","params":{"code":"User.count"}}"#)
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("confirmation_denied"));

        // Denial is recorded in both the history and the audit log.
        let history = state.confirmation.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].approved);
        let entries = state.audit.read_all().expect("audit");
        assert_eq!(entries[0].result_summary, "denied");
    }

    #[tokio::test]
    async fn test_eval_approved_reaches_adapter() {
        let (_dir, state, server) = console(ConfirmationMode::AutoApprove);
        let resp = server
            .dispatch_line(r#"{"tool":"eval","params":{"code":"User.count","timeout_secs":9999}}"#)
            .await;
        // Approved, forwarded, and the embedded adapter answers
        // unsupported -- but the confirmation history shows the clamp.
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("unsupported"));

        let history = state.confirmation.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].approved);
        assert_eq!(history[0].request.params["timeout_secs"], 30);
    }

    #[tokio::test]
    async fn test_tier3_unsupported_in_embedded_mode() {
        let (_dir, _state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server.dispatch_line(r#"{"tool":"job_queues"}"#).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_type.as_deref(), Some("unsupported"));
    }

    #[tokio::test]
    async fn test_closed_tool_set() {
        let (_dir, _state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server.dispatch_line(r#"{"tool":"drop_all_tables"}"#).await;
        assert_eq!(resp.error_type.as_deref(), Some("unknown_tool"));

        let names = server.tool_names();
        for expected in ["count", "sample", "find", "pluck", "aggregate", "association_count",
            "schema", "recent", "status", "diagnose_model", "data_snapshot", "update_setting",
            "job_queues", "job_find", "redis_info", "eval", "sql", "query"]
        {
            assert!(names.contains(&expected), "{expected} missing");
        }
    }

    #[tokio::test]
    async fn test_query_builder_through_pipeline() {
        let (_dir, _state, server) = console(ConfirmationMode::AutoDeny);
        let resp = server
            .dispatch_line(r#"{"tool":"query","params":{"model":"User","select":["id","email"],"limit":5}}"#)
            .await;
        assert!(resp.ok);
        let result = resp.result.expect("result");
        assert_eq!(result["count"], 1);
    }
}
