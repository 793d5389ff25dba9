//! End-to-end console safety: registry built from extracted metadata,
//! the full pipeline over the embedded adapter, and rollback proof.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::json;

use atlas_console::{
    build_console_server, AuditLogger, Confirmation, ConfirmationMode, ConsoleState, Dialect,
    EmbeddedAdapter, ModelRegistry, SafeContext, SqlValidator,
};
use atlas_core::store::memory::InMemoryMetadataStore;
use atlas_core::store::MetadataStore;
use atlas_core::types::{ExtractedUnit, UnitType};

struct Console {
    _dir: tempfile::TempDir,
    conn: Arc<Mutex<Connection>>,
    state: Arc<ConsoleState>,
    server: atlas_server::ToolServer,
}

fn console() -> Console {
    let dir = tempfile::tempdir().expect("create temp dir");

    // The registry comes from extracted model metadata, exactly as the
    // console binary builds it.
    let metadata = InMemoryMetadataStore::new();
    let mut user = ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb");
    user.metadata.insert("table_name".into(), json!("users"));
    user.metadata
        .insert("columns".into(), json!(["id", "email", "encrypted_password"]));
    metadata.store(&user).expect("store");
    let mut post = ExtractedUnit::new(UnitType::Model, "Post", "app/models/post.rb");
    post.metadata.insert("table_name".into(), json!("posts"));
    post.metadata.insert("columns".into(), json!(["id", "user_id", "title"]));
    metadata.store(&post).expect("store");

    let registry = Arc::new(ModelRegistry::from_metadata(&metadata).expect("registry"));

    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, encrypted_password TEXT);
         CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT);
         INSERT INTO users (email, encrypted_password) VALUES ('a@example.com', 'hunter2');",
    )
    .expect("seed");
    let conn = Arc::new(Mutex::new(conn));

    let safe = SafeContext::new(conn.clone(), Dialect::Sqlite, 5000);
    let adapter = Arc::new(EmbeddedAdapter::new(safe, registry.clone()));

    let state = Arc::new(ConsoleState {
        adapter,
        registry,
        confirmation: Arc::new(Confirmation::new(ConfirmationMode::AutoDeny)),
        audit: Arc::new(AuditLogger::new(dir.path().join("audit.jsonl"))),
        sql_validator: Arc::new(SqlValidator::new()),
        redacted_columns: vec!["encrypted_password".into()],
    });
    let server = build_console_server(&state);

    Console { _dir: dir, conn, state, server }
}

#[tokio::test]
async fn unknown_model_scenario_frame() {
    let c = console();
    let resp = c
        .server
        .dispatch_line(r#"{"id":"r1","tool":"count","params":{"model":"Hacker"}}"#)
        .await;

    assert_eq!(resp.id.as_deref(), Some("r1"));
    assert!(!resp.ok);
    assert_eq!(resp.error_type.as_deref(), Some("validation"));
    assert_eq!(
        resp.error.as_deref(),
        Some("Unknown model: Hacker. Available: Post, User")
    );
}

#[tokio::test]
async fn multi_statement_sql_scenario_frame() {
    let c = console();
    let resp = c
        .server
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
async fn no_write_survives_the_safe_context() {
    let c = console();

    // The query builder and sql tool both run inside the rolled-back
    // transaction; whatever they did, the table is unchanged after.
    let _ = c
        .server
        .dispatch_line(r#"{"tool":"sql","params":{"sql":"SELECT * FROM users"}}"#)
        .await;
    let _ = c
        .server
        .dispatch_line(r#"{"tool":"query","params":{"model":"User","limit":10}}"#)
        .await;

    let count: i64 = c
        .conn
        .lock()
        .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn every_call_is_audited() {
    let c = console();

    let frames = [
        r#"{"tool":"count","params":{"model":"User"}}"#,
        r#"{"tool":"sample","params":{"model":"Post","limit":3}}"#,
        r#"{"tool":"eval","params":{"code":"1 + 1"}}"#,
    ];
    for frame in frames {
        let _ = c.server.dispatch_line(frame).await;
    }

    let entries = c.state.audit.read_all().expect("audit");
    assert_eq!(entries.len(), 3);
    let tools: Vec<&str> = entries.iter().map(|e| e.tool.as_str()).collect();
    assert_eq!(tools, vec!["count", "sample", "eval"]);
    // The denied eval is audited as unconfirmed.
    assert!(!entries[2].confirmed);
    assert_eq!(entries[2].result_summary, "denied");
}

#[tokio::test]
async fn redaction_applies_to_every_result_shape() {
    let c = console();

    let resp = c
        .server
        .dispatch_line(r#"{"tool":"find","params":{"model":"User","id":1}}"#)
        .await;
    assert!(resp.ok);
    let record = resp.result.expect("result")["record"].clone();
    assert_eq!(record["encrypted_password"], "[REDACTED]");
    assert_eq!(record["email"], "a@example.com");
}
