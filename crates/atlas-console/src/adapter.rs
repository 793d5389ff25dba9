//! Live-application adapters.
//!
//! The console talks to the running application through one narrow
//! contract: [`LiveAdapter::send_request`], the same request/response
//! shape the tool transport uses. Two modes ship:
//!
//! - **embedded**: an in-process adapter over the application's SQLite
//!   database, executing everything inside a [`SafeContext`]. Tier 1 is
//!   fully implemented plus `diagnose_model`, `data_snapshot`, `sql`,
//!   and `query`; the remaining tiers answer `unsupported` until ported.
//! - **bridge**: a child process speaking the wire protocol over its
//!   stdio; every request is forwarded verbatim.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use atlas_core::error::{AtlasError, AtlasResult, ErrorKind};
use atlas_server::protocol::{ToolRequest, ToolResponse};

use crate::registry::ModelRegistry;
use crate::safety::SafeContext;

/// Maximum rows `sample` returns.
pub const SAMPLE_CAP: usize = 25;
/// Maximum rows `pluck` returns.
pub const PLUCK_CAP: usize = 1000;
/// Maximum rows `recent` returns.
pub const RECENT_CAP: usize = 50;
/// Maximum rows `sql` and `query` return.
pub const SQL_ROW_CAP: usize = 10_000;
/// Maximum association depth for `data_snapshot`.
pub const SNAPSHOT_DEPTH_CAP: usize = 3;

/// Executes console requests against the live application.
pub trait LiveAdapter: Send + Sync {
    /// Adapter name for status output.
    fn name(&self) -> &str;

    /// Execute one request, returning a response frame.
    fn send_request(&self, request: &ToolRequest) -> ToolResponse;
}

// ---------------------------------------------------------------------------
// Embedded adapter
// ---------------------------------------------------------------------------

/// In-process adapter over the application database.
pub struct EmbeddedAdapter {
    safe: SafeContext,
    registry: Arc<ModelRegistry>,
}

type Row = BTreeMap<String, serde_json::Value>;

impl EmbeddedAdapter {
    /// Wrap a safe context and the model registry.
    pub fn new(safe: SafeContext, registry: Arc<ModelRegistry>) -> Self {
        Self { safe, registry }
    }

    fn handle(&self, request: &ToolRequest) -> AtlasResult<serde_json::Value> {
        let params = &request.params;
        match request.tool.as_str() {
            "count" => self.count(params),
            "sample" => self.sample(params),
            "find" => self.find(params),
            "pluck" => self.pluck(params),
            "aggregate" => self.aggregate(params),
            "association_count" => self.association_count(params),
            "schema" => self.schema(params),
            "recent" => self.recent(params),
            "status" => self.status(),
            "diagnose_model" => self.diagnose_model(params),
            "data_snapshot" => self.data_snapshot(params),
            "sql" => self.raw_sql(params),
            "query" => self.query(params),
            other => Err(AtlasError::Unsupported { operation: other.to_string() }),
        }
    }

    fn model<'a>(&'a self, params: &serde_json::Value) -> AtlasResult<(&'a crate::registry::ModelInfo, String)> {
        let name = params
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AtlasError::validation("missing required parameter: model"))?;
        let info = self.registry.validate_model(name)?;
        Ok((info, name.to_string()))
    }

    fn count(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, _) = self.model(params)?;
        let sql = format!("SELECT COUNT(*) AS count FROM {}", info.table);
        let rows = self.safe.execute(|tx| query_rows(tx, &sql, SAMPLE_CAP))?;
        Ok(serde_json::json!({"count": rows.first().and_then(|r| r.get("count")).cloned()}))
    }

    fn sample(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, _) = self.model(params)?;
        let limit = limit_param(params, SAMPLE_CAP, SAMPLE_CAP);
        let sql = format!("SELECT * FROM {} ORDER BY RANDOM() LIMIT {limit}", info.table);
        let records = self.safe.execute(|tx| query_rows(tx, &sql, limit))?;
        Ok(serde_json::json!({"records": records}))
    }

    fn find(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, model) = self.model(params)?;

        let (column, value) = if let Some(id) = params.get("id") {
            (info.primary_key.clone(), id.clone())
        } else {
            let column = params
                .get("column")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AtlasError::validation("find requires id or column/value"))?;
            let column = self.registry.validate_column(&model, column)?.to_string();
            let value = params
                .get("value")
                .cloned()
                .ok_or_else(|| AtlasError::validation("find requires id or column/value"))?;
            (column, value)
        };

        let sql = format!(
            "SELECT * FROM {} WHERE {column} = {} LIMIT 1",
            info.table,
            sql_literal(&value)
        );
        let records = self.safe.execute(|tx| query_rows(tx, &sql, 1))?;
        match records.into_iter().next() {
            Some(record) => Ok(serde_json::json!({"record": record})),
            None => Err(AtlasError::NotFound {
                entity: format!("{model} with {column} = {value}"),
            }),
        }
    }

    fn pluck(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, model) = self.model(params)?;
        let columns = params
            .get("columns")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AtlasError::validation("missing required parameter: columns"))?;
        let mut validated = Vec::new();
        for column in columns {
            let name = column
                .as_str()
                .ok_or_else(|| AtlasError::validation("columns must be strings"))?;
            validated.push(self.registry.validate_column(&model, name)?.to_string());
        }
        if validated.is_empty() {
            return Err(AtlasError::validation("columns must not be empty"));
        }

        let distinct = params.get("distinct").and_then(|v| v.as_bool()).unwrap_or(false);
        let limit = limit_param(params, PLUCK_CAP, PLUCK_CAP);
        let sql = format!(
            "SELECT {}{} FROM {} LIMIT {limit}",
            if distinct { "DISTINCT " } else { "" },
            validated.join(", "),
            info.table
        );
        let rows = self.safe.execute(|tx| query_rows(tx, &sql, limit))?;
        let values: Vec<Vec<serde_json::Value>> = rows
            .iter()
            .map(|row| validated.iter().map(|c| row.get(c).cloned().unwrap_or(serde_json::Value::Null)).collect())
            .collect();
        Ok(serde_json::json!({"columns": validated, "values": values}))
    }

    fn aggregate(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, model) = self.model(params)?;
        let function = params
            .get("function")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AtlasError::validation("missing required parameter: function"))?;
        let sql_fn = match function {
            "sum" => "SUM",
            "average" => "AVG",
            "minimum" => "MIN",
            "maximum" => "MAX",
            other => {
                return Err(AtlasError::validation(format!(
                    "unknown aggregate function: {other}. Available: sum, average, minimum, maximum"
                )))
            }
        };
        let column = params
            .get("column")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AtlasError::validation("missing required parameter: column"))?;
        let column = self.registry.validate_column(&model, column)?;

        let sql = format!("SELECT {sql_fn}({column}) AS value FROM {}", info.table);
        let rows = self.safe.execute(|tx| query_rows(tx, &sql, 1))?;
        Ok(serde_json::json!({
            "function": function,
            "column": column,
            "value": rows.first().and_then(|r| r.get("value")).cloned(),
        }))
    }

    fn association_count(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (_, model) = self.model(params)?;
        let association = params
            .get("association")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AtlasError::validation("missing required parameter: association"))?;
        let assoc = self.registry.validate_association(&model, association)?;
        let id = params
            .get("id")
            .cloned()
            .ok_or_else(|| AtlasError::validation("missing required parameter: id"))?;

        let sql = format!(
            "SELECT COUNT(*) AS count FROM {} WHERE {} = {}",
            assoc.table,
            assoc.foreign_key,
            sql_literal(&id)
        );
        let rows = self.safe.execute(|tx| query_rows(tx, &sql, 1))?;
        Ok(serde_json::json!({
            "association": association,
            "count": rows.first().and_then(|r| r.get("count")).cloned(),
        }))
    }

    fn schema(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, _) = self.model(params)?;
        let include_indexes =
            params.get("indexes").and_then(|v| v.as_bool()).unwrap_or(false);

        let mut result = serde_json::json!({
            "table": info.table,
            "primary_key": info.primary_key,
            "columns": info.columns,
        });

        if include_indexes {
            let sql = format!("PRAGMA index_list({})", info.table);
            let indexes = self.safe.execute(|tx| query_rows(tx, &sql, 100))?;
            result["indexes"] = serde_json::json!(indexes);
        }
        Ok(result)
    }

    fn recent(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, model) = self.model(params)?;
        let order_by = match params.get("order_by").and_then(|v| v.as_str()) {
            Some(column) => self.registry.validate_column(&model, column)?.to_string(),
            None if info.columns.iter().any(|c| c == "created_at") => "created_at".to_string(),
            None => info.primary_key.clone(),
        };
        let direction = match params.get("direction").and_then(|v| v.as_str()) {
            None | Some("desc") => "DESC",
            Some("asc") => "ASC",
            Some(other) => {
                return Err(AtlasError::validation(format!(
                    "direction must be asc or desc, got {other}"
                )))
            }
        };
        let limit = limit_param(params, 10, RECENT_CAP);

        let sql = format!(
            "SELECT * FROM {} ORDER BY {order_by} {direction} LIMIT {limit}",
            info.table
        );
        let records = self.safe.execute(|tx| query_rows(tx, &sql, limit))?;
        Ok(serde_json::json!({"records": records, "order_by": order_by, "direction": direction}))
    }

    fn status(&self) -> AtlasResult<serde_json::Value> {
        Ok(serde_json::json!({
            "adapter": "embedded",
            "dialect": self.safe.dialect().as_str(),
            "models": self.registry.model_names(),
        }))
    }

    fn diagnose_model(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let count = self.count(params)?;
        let recent = self.recent(params)?;
        let (info, _) = self.model(params)?;
        Ok(serde_json::json!({
            "table": info.table,
            "count": count["count"],
            "recent": recent["records"],
        }))
    }

    fn data_snapshot(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (_, model) = self.model(params)?;
        let depth = params
            .get("depth")
            .and_then(serde_json::Value::as_u64)
            .map_or(1, |d| d as usize)
            .min(SNAPSHOT_DEPTH_CAP);
        let id = params
            .get("id")
            .cloned()
            .ok_or_else(|| AtlasError::validation("missing required parameter: id"))?;

        self.snapshot_record(&model, &id, depth)
    }

    fn snapshot_record(
        &self,
        model: &str,
        id: &serde_json::Value,
        depth: usize,
    ) -> AtlasResult<serde_json::Value> {
        let record =
            self.find(&serde_json::json!({"model": model, "id": id}))?["record"].clone();

        let mut associations = serde_json::Map::new();
        if depth > 0 {
            let info = self.registry.validate_model(model)?;
            for (name, assoc) in &info.associations {
                let sql = format!(
                    "SELECT * FROM {} WHERE {} = {} LIMIT 5",
                    assoc.table,
                    assoc.foreign_key,
                    sql_literal(id)
                );
                let rows = self.safe.execute(|tx| query_rows(tx, &sql, 5))?;
                associations.insert(
                    name.clone(),
                    serde_json::json!({"kind": assoc.kind, "records": rows}),
                );
            }
        }

        Ok(serde_json::json!({
            "model": model,
            "record": record,
            "associations": associations,
            "depth": depth,
        }))
    }

    fn raw_sql(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let sql = params
            .get("sql")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AtlasError::validation("missing required parameter: sql"))?;
        let limit = limit_param(params, SQL_ROW_CAP, SQL_ROW_CAP);
        let rows = self.safe.execute(|tx| query_rows(tx, sql, limit))?;
        Ok(serde_json::json!({"count": rows.len(), "rows": rows}))
    }

    fn query(&self, params: &serde_json::Value) -> AtlasResult<serde_json::Value> {
        let (info, model) = self.model(params)?;

        let select = match params.get("select").and_then(|v| v.as_array()) {
            Some(columns) => {
                let mut validated = Vec::new();
                for column in columns {
                    let name = column
                        .as_str()
                        .ok_or_else(|| AtlasError::validation("select entries must be strings"))?;
                    validated.push(self.registry.validate_column(&model, name)?.to_string());
                }
                validated.join(", ")
            }
            None => "*".to_string(),
        };

        let mut sql = format!("SELECT {select} FROM {}", info.table);

        if let Some(joins) = params.get("joins").and_then(|v| v.as_array()) {
            for join in joins {
                let name = join
                    .as_str()
                    .ok_or_else(|| AtlasError::validation("joins entries must be strings"))?;
                let assoc = self.registry.validate_association(&model, name)?;
                sql.push_str(&format!(
                    " JOIN {} ON {}.{} = {}.{}",
                    assoc.table, assoc.table, assoc.foreign_key, info.table, info.primary_key
                ));
            }
        }

        if let Some(group_by) = params.get("group_by").and_then(|v| v.as_str()) {
            let column = self.registry.validate_column(&model, group_by)?;
            sql.push_str(&format!(" GROUP BY {column}"));
            if let Some(having) = params.get("having").and_then(|v| v.as_str()) {
                // Having clauses are restricted to count comparisons.
                let count: u64 = having.parse().map_err(|_| {
                    AtlasError::validation("having must be a minimum group count")
                })?;
                sql.push_str(&format!(" HAVING COUNT(*) >= {count}"));
            }
        }

        if let Some(order) = params.get("order").and_then(|v| v.as_str()) {
            let column = self.registry.validate_column(&model, order)?;
            sql.push_str(&format!(" ORDER BY {column}"));
        }

        let limit = limit_param(params, 100, SQL_ROW_CAP);
        sql.push_str(&format!(" LIMIT {limit}"));

        let rows = self.safe.execute(|tx| query_rows(tx, &sql, limit))?;
        Ok(serde_json::json!({"count": rows.len(), "rows": rows, "sql": sql}))
    }
}

impl LiveAdapter for EmbeddedAdapter {
    fn name(&self) -> &str {
        "embedded"
    }

    fn send_request(&self, request: &ToolRequest) -> ToolResponse {
        let start = Instant::now();
        match self.handle(request) {
            Ok(result) => ToolResponse::success(
                request.id.clone(),
                result,
                start.elapsed().as_millis() as u64,
            ),
            Err(err) => ToolResponse::failure(
                request.id.clone(),
                err.kind(),
                err.to_string(),
                start.elapsed().as_millis() as u64,
            ),
        }
    }
}

/// Clamp a limit parameter to a cap, with a default.
fn limit_param(params: &serde_json::Value, default: usize, cap: usize) -> usize {
    params
        .get("limit")
        .and_then(serde_json::Value::as_u64)
        .map_or(default, |v| v as usize)
        .clamp(1, cap)
}

/// Render a JSON scalar as a SQL literal, escaping quotes.
fn sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Run a query and convert rows to JSON maps.
fn query_rows(
    tx: &rusqlite::Transaction<'_>,
    sql: &str,
    limit: usize,
) -> AtlasResult<Vec<Row>> {
    let mut stmt = tx.prepare(sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if out.len() >= limit {
            break;
        }
        let mut record = Row::new();
        for (i, name) in column_names.iter().enumerate() {
            let value = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                rusqlite::types::ValueRef::Integer(v) => serde_json::json!(v),
                rusqlite::types::ValueRef::Real(v) => serde_json::json!(v),
                rusqlite::types::ValueRef::Text(v) => {
                    serde_json::json!(String::from_utf8_lossy(v))
                }
                rusqlite::types::ValueRef::Blob(v) => {
                    serde_json::json!(format!("<{} bytes>", v.len()))
                }
            };
            record.insert(name.clone(), value);
        }
        out.push(record);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Bridge adapter
// ---------------------------------------------------------------------------

/// Out-of-process adapter: a child process speaking the wire protocol
/// over its stdio, one request per line.
pub struct BridgeAdapter {
    child: Mutex<BridgeChild>,
    command: String,
}

struct BridgeChild {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeAdapter {
    /// Spawn the bridge process.
    pub fn spawn(command: &str, args: &[String]) -> AtlasResult<Self> {
        let mut process = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| AtlasError::Internal(format!("failed to spawn bridge {command}: {e}")))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| AtlasError::Internal("bridge stdin unavailable".into()))?;
        let stdout = process
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| AtlasError::Internal("bridge stdout unavailable".into()))?;

        tracing::info!(command = %command, "bridge adapter spawned");
        Ok(Self {
            child: Mutex::new(BridgeChild { process, stdin, stdout }),
            command: command.to_string(),
        })
    }

    fn round_trip(&self, request: &ToolRequest) -> AtlasResult<ToolResponse> {
        let frame = serde_json::to_string(request)
            .map_err(|e| AtlasError::Serialization(e.to_string()))?;

        let mut child = self.child.lock();
        writeln!(child.stdin, "{frame}")?;
        child.stdin.flush()?;

        let mut line = String::new();
        let read = child.stdout.read_line(&mut line)?;
        if read == 0 {
            return Err(AtlasError::Internal(format!(
                "bridge {} closed its stdout",
                self.command
            )));
        }
        serde_json::from_str(&line).map_err(|e| AtlasError::Serialization(e.to_string()))
    }
}

impl LiveAdapter for BridgeAdapter {
    fn name(&self) -> &str {
        "bridge"
    }

    fn send_request(&self, request: &ToolRequest) -> ToolResponse {
        match self.round_trip(request) {
            Ok(response) => response,
            Err(err) => ToolResponse::failure(
                request.id.clone(),
                ErrorKind::Execution,
                err.to_string(),
                0,
            ),
        }
    }
}

impl Drop for BridgeAdapter {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        if let Err(e) = child.process.kill() {
            tracing::debug!(error = %e, "bridge process already exited");
        }
        let _ = child.process.wait();
    }
}
