//! The safety perimeter: rolled-back transactions, confirmation gates,
//! audit logging, and column redaction.
//!
//! Every console query executes inside [`SafeContext::execute`], which
//! acquires a transaction and rolls it back on every exit path. Even a
//! handler that claims to write cannot commit from inside the block.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use atlas_core::error::{AtlasError, AtlasResult};

/// Database dialect, for dialect-aware statement timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL: `statement_timeout` in milliseconds.
    Postgres,
    /// MySQL: `max_execution_time` in milliseconds.
    Mysql,
    /// SQLite: no per-statement timeout statement.
    Sqlite,
}

impl Dialect {
    /// The SET statement enforcing a timeout, when the dialect has one.
    pub fn timeout_statement(&self, ms: u64) -> Option<String> {
        match self {
            Self::Postgres => Some(format!("SET statement_timeout = {ms}")),
            Self::Mysql => Some(format!("SET max_execution_time = {ms}")),
            Self::Sqlite => None,
        }
    }

    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Rolled-back transaction envelope around live-data queries.
pub struct SafeContext {
    conn: Arc<Mutex<Connection>>,
    dialect: Dialect,
    statement_timeout_ms: u64,
}

impl SafeContext {
    /// Wrap a connection.
    pub fn new(conn: Arc<Mutex<Connection>>, dialect: Dialect, statement_timeout_ms: u64) -> Self {
        Self { conn, dialect, statement_timeout_ms }
    }

    /// The connection's dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Run `f` inside a transaction that is unconditionally rolled
    /// back, with the dialect's statement timeout applied first.
    pub fn execute<T, F>(&self, f: F) -> AtlasResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> AtlasResult<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(statement) = self.dialect.timeout_statement(self.statement_timeout_ms) {
            tx.execute_batch(&statement)?;
        }

        let result = f(&tx);

        // Rollback on every exit path; nothing inside the block commits.
        tx.rollback()?;
        result
    }
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Callback signature for interactive confirmation.
pub type ConfirmCallback = Arc<dyn Fn(&ConfirmationRequest) -> bool + Send + Sync>;

/// How mutating and escape-hatch tools are authorized.
#[derive(Clone)]
pub enum ConfirmationMode {
    /// Approve everything (scripted sessions).
    AutoApprove,
    /// Deny everything (the safe default).
    AutoDeny,
    /// Ask the callback per request.
    Callback(ConfirmCallback),
}

impl ConfirmationMode {
    /// Parse a config string; callbacks are constructed in code.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_approve" => Some(Self::AutoApprove),
            "auto_deny" => Some(Self::AutoDeny),
            _ => None,
        }
    }
}

/// One confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// The tool asking for authorization.
    pub tool: String,
    /// Its parameters.
    pub params: serde_json::Value,
    /// Request timestamp (UTC ISO-8601).
    pub timestamp: String,
}

/// A decided confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    /// The request.
    pub request: ConfirmationRequest,
    /// Whether it was approved.
    pub approved: bool,
}

/// Authorization gate with an in-memory decision history.
pub struct Confirmation {
    mode: ConfirmationMode,
    history: Mutex<Vec<ConfirmationRecord>>,
}

impl Confirmation {
    /// A gate in the given mode.
    pub fn new(mode: ConfirmationMode) -> Self {
        Self { mode, history: Mutex::new(Vec::new()) }
    }

    /// Ask for authorization; denial is an error. Every request lands
    /// in the history, approved or not.
    pub fn confirm(&self, tool: &str, params: &serde_json::Value) -> AtlasResult<()> {
        let request = ConfirmationRequest {
            tool: tool.to_string(),
            params: params.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let approved = match &self.mode {
            ConfirmationMode::AutoApprove => true,
            ConfirmationMode::AutoDeny => false,
            ConfirmationMode::Callback(callback) => callback(&request),
        };

        self.history
            .lock()
            .push(ConfirmationRecord { request, approved });

        if approved {
            Ok(())
        } else {
            Err(AtlasError::ConfirmationDenied { tool: tool.to_string() })
        }
    }

    /// All decisions so far, in order.
    pub fn history(&self) -> Vec<ConfirmationRecord> {
        self.history.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// The invoked tool.
    pub tool: String,
    /// Its parameters.
    pub params: serde_json::Value,
    /// Whether a confirmation gate approved the call (true when no
    /// gate applied).
    pub confirmed: bool,
    /// Short result summary ("ok (3 rows)", "error: ...").
    pub result_summary: String,
    /// Entry timestamp (UTC ISO-8601).
    pub timestamp: String,
}

/// JSON-lines audit appender.
pub struct AuditLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    /// A logger appending to the given path. The parent directory is
    /// created on first write if absent.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    /// Append one entry.
    pub fn log(
        &self,
        tool: &str,
        params: &serde_json::Value,
        confirmed: bool,
        result_summary: &str,
    ) -> AtlasResult<()> {
        let entry = AuditEntry {
            tool: tool.to_string(),
            params: params.clone(),
            confirmed,
            result_summary: result_summary.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let json =
            serde_json::to_string(&entry).map_err(|e| AtlasError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        Ok(())
    }

    /// Read all entries (diagnostics and tests).
    pub fn read_all(&self) -> AtlasResult<Vec<AuditEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Replace the value of every redacted column with `[REDACTED]`,
/// recursively through objects and arrays.
pub fn redact_value(value: &mut serde_json::Value, redacted: &[String]) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if redacted.iter().any(|r| r == key) {
                    *entry = serde_json::Value::String("[REDACTED]".to_string());
                } else {
                    redact_value(entry, redacted);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_value(item, redacted);
            }
        }
        _ => {}
    }
}

/// Redact a list of records (the common tool-result shape).
pub fn redact_records(
    records: &mut [BTreeMap<String, serde_json::Value>],
    redacted: &[String],
) {
    for record in records {
        for (key, entry) in record.iter_mut() {
            if redacted.iter().any(|r| r == key) {
                *entry = serde_json::Value::String("[REDACTED]".to_string());
            }
        }
    }
}
