//! Integration tests driving the registered tool surface end to end.

use std::path::Path;
use std::sync::Arc;

use atlas_core::config::Config;
use atlas_core::manifest::IndexManifest;
use atlas_core::store::files::FileUnitStore;
use atlas_core::types::{Dependency, DependencyVia, ExtractedUnit, UnitType};
use atlas_server::{build_server, ServerState, ToolServer};

fn seed_index(dir: &Path) {
    let files = FileUnitStore::new(dir);

    let mut user = ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb");
    user.source_code = Some("class User < ApplicationRecord\n  has_many :posts\nend".into());
    user.dependencies.push(Dependency {
        target: "Post".into(),
        dep_type: "has_many".into(),
        via: DependencyVia::Association,
    });

    let mut post = ExtractedUnit::new(UnitType::Model, "Post", "app/models/post.rb");
    post.source_code = Some("class Post < ApplicationRecord\nend".into());

    let mut controller = ExtractedUnit::new(
        UnitType::Controller,
        "PostsController",
        "app/controllers/posts_controller.rb",
    );
    controller.source_code = Some("class PostsController < ApplicationController\nend".into());
    controller.dependencies.push(Dependency {
        target: "Post".into(),
        dep_type: "references".into(),
        via: DependencyVia::CodeReference,
    });

    let units = vec![user, post, controller];
    for unit in &units {
        files.write_unit(unit).expect("write unit");
    }
    IndexManifest::from_units(&units, "abc123", "main", "ruby 3.3.0", None)
        .write(dir)
        .expect("write manifest");
}

fn server_over(dir: &Path) -> (Arc<ServerState>, ToolServer) {
    seed_index(dir);
    let mut config = Config::defaults(dir);
    // Tests must not sleep through the real cooldown.
    config.pipeline.cooldown_secs = 60;
    let state = ServerState::from_config(&config).expect("state");
    let server = build_server(&state);
    (state, server)
}

#[tokio::test]
async fn test_lookup_round_trip() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server
        .dispatch_line(r#"{"id":"r1","tool":"lookup","params":{"identifier":"User"}}"#)
        .await;
    assert!(resp.ok, "error: {:?}", resp.error);
    let result = resp.result.expect("result");
    assert_eq!(result["data"]["identifier"], "User");
    assert_eq!(result["data"]["type"], "model");
    assert!(result["content"][0]["text"]
        .as_str()
        .expect("text")
        .contains("User"));
}

#[tokio::test]
async fn test_lookup_missing_is_validation_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server
        .dispatch_line(r#"{"tool":"lookup","params":{"identifier":"Ghost"}}"#)
        .await;
    assert!(!resp.ok);
    assert_eq!(resp.error_type.as_deref(), Some("validation"));
}

#[tokio::test]
async fn test_search_with_type_filter() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server
        .dispatch_line(r#"{"tool":"search","params":{"query":"post","type":"model"}}"#)
        .await;
    assert!(resp.ok);
    let data = &resp.result.expect("result")["data"];
    let ids: Vec<&str> = data["results"]
        .as_array()
        .expect("results")
        .iter()
        .map(|r| r["identifier"].as_str().expect("id"))
        .collect();
    assert!(ids.contains(&"Post"));
    assert!(!ids.contains(&"PostsController"));
}

#[tokio::test]
async fn test_dependents_lists_reverse_edges() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server
        .dispatch_line(r#"{"tool":"dependents","params":{"identifier":"Post"}}"#)
        .await;
    assert!(resp.ok);
    let data = &resp.result.expect("result")["data"];
    assert_eq!(data["count"], 2);
}

#[tokio::test]
async fn test_codebase_retrieve_emits_context() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server
        .dispatch_line(
            r#"{"tool":"codebase_retrieve","params":{"query":"Where is the PostsController?","budget":2000}}"#,
        )
        .await;
    assert!(resp.ok);
    let result = resp.result.expect("result");
    assert_eq!(result["data"]["strategy"], "keyword");
    assert_eq!(result["data"]["budget"], 2000);
    let sources = result["data"]["sources"].as_array().expect("sources");
    assert!(sources
        .iter()
        .any(|s| s["identifier"] == "PostsController"));
}

#[tokio::test]
async fn test_pipeline_extract_rate_limited_on_second_call() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let first = server.dispatch_line(r#"{"tool":"pipeline_extract"}"#).await;
    assert!(first.ok);
    assert_eq!(first.result.expect("result")["data"]["status"], "started");

    let second = server.dispatch_line(r#"{"tool":"pipeline_extract"}"#).await;
    assert!(second.ok);
    assert_eq!(second.result.expect("result")["data"]["status"], "rate-limited");
}

#[tokio::test]
async fn test_pipeline_status_reports_counts() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server.dispatch_line(r#"{"tool":"pipeline_status"}"#).await;
    assert!(resp.ok);
    let data = &resp.result.expect("result")["data"];
    assert_eq!(data["status"], "ok");
    assert_eq!(data["total_units"], 3);
    assert_eq!(data["counts_by_type"]["model"], 2);
}

#[tokio::test]
async fn test_resource_uris() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    let resp = server
        .dispatch_line(r#"{"tool":"resource","params":{"uri":"codebase://manifest"}}"#)
        .await;
    assert!(resp.ok);
    assert_eq!(resp.result.expect("result")["data"]["git_sha"], "abc123");

    let resp = server
        .dispatch_line(r#"{"tool":"resource","params":{"uri":"codebase://unit/User"}}"#)
        .await;
    assert!(resp.ok);
    assert_eq!(resp.result.expect("result")["data"]["identifier"], "User");

    let resp = server
        .dispatch_line(r#"{"tool":"resource","params":{"uri":"codebase://type/model"}}"#)
        .await;
    assert!(resp.ok);
    assert_eq!(resp.result.expect("result")["data"]["count"], 2);

    let resp = server
        .dispatch_line(r#"{"tool":"resource","params":{"uri":"other://thing"}}"#)
        .await;
    assert!(!resp.ok);
    assert_eq!(resp.error_type.as_deref(), Some("validation"));
}

#[tokio::test]
async fn test_feedback_cycle() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    for query in ["billing broken", "billing missing data", "billing report empty"] {
        let frame = format!(
            r#"{{"tool":"retrieval_rate","params":{{"query":"{query}","score":1}}}}"#
        );
        let resp = server.dispatch_line(&frame).await;
        assert!(resp.ok);
    }

    let resp = server
        .dispatch_line(r#"{"tool":"retrieval_rate","params":{"query":"q","score":9}}"#)
        .await;
    assert!(!resp.ok);
    assert_eq!(resp.error_type.as_deref(), Some("validation"));

    let resp = server.dispatch_line(r#"{"tool":"retrieval_suggest"}"#).await;
    assert!(resp.ok);
    let data = &resp.result.expect("result")["data"];
    assert!(data["issue_count"].as_u64().expect("count") >= 1);
}

#[tokio::test]
async fn test_tool_registry_is_closed() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let (_state, server) = server_over(dir.path());

    // Internal helpers must not be reachable by name.
    for private in ["run_extraction", "respond", "unit_to_json"] {
        let frame = format!(r#"{{"tool":"{private}"}}"#);
        let resp = server.dispatch_line(&frame).await;
        assert_eq!(resp.error_type.as_deref(), Some("unknown_tool"));
    }

    let names = server.tool_names();
    for expected in [
        "lookup",
        "search",
        "dependencies",
        "dependents",
        "structure",
        "graph_analysis",
        "pagerank",
        "framework",
        "recent_changes",
        "reload",
        "codebase_retrieve",
        "trace_flow",
        "pipeline_status",
        "pipeline_extract",
        "pipeline_embed",
        "pipeline_diagnose",
        "pipeline_repair",
        "retrieval_rate",
        "report_gap",
        "retrieval_explain",
        "retrieval_suggest",
        "resource",
    ] {
        assert!(names.contains(&expected), "{expected} not registered");
    }
}
