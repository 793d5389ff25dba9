//! HTTP transport: the same JSON frames as stdio, POSTed to `/rpc`.
//!
//! Unlike the stdio transport, concurrent in-flight requests are fine
//! here; axum handles each request on its own task.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::protocol::ToolResponse;
use crate::server::ToolServer;

/// Build the router exposing the tool server.
pub fn router(server: Arc<ToolServer>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/healthz", get(handle_health))
        .route("/tools", get(handle_tools))
        .with_state(server)
}

/// Serve the router on the given address until shutdown.
pub async fn serve(server: Arc<ToolServer>, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "http transport ready");
    axum::serve(listener, router(server)).await?;
    Ok(())
}

async fn handle_rpc(
    State(server): State<Arc<ToolServer>>,
    body: String,
) -> (StatusCode, Json<ToolResponse>) {
    let response = server.dispatch_line(&body).await;
    // Tool-level failures are still HTTP 200; the frame carries the
    // error category. Only transport-level parse failures are 400.
    let status = if response.error_type.as_deref() == Some("parse") {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn handle_tools(State(server): State<Arc<ToolServer>>) -> Json<serde_json::Value> {
    let tools: Vec<serde_json::Value> = server
        .specs()
        .iter()
        .map(|spec| {
            serde_json::json!({
                "name": spec.name,
                "description": spec.description,
                "params": spec.params.iter().map(|p| serde_json::json!({
                    "name": p.name,
                    "required": p.required,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(serde_json::json!({"tools": tools}))
}
