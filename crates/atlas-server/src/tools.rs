//! Read-side, pipeline, and feedback tool registrations.
//!
//! Every tool closes over the shared [`ServerState`] and returns a
//! domain JSON value; the configured renderer serializes a text part so
//! responses carry `{content: [{type: "text", ...}], data: ...}`.

use std::path::PathBuf;
use std::sync::Arc;

use atlas_core::config::Config;
use atlas_core::embedder::EmbeddingProvider;
use atlas_core::error::{AtlasError, AtlasResult};
use atlas_core::feedback::{FeedbackStore, GapDetector};
use atlas_core::formatter::{format_context, renderer_for, OutputFormat, ToolRenderer};
use atlas_core::guard::{OperationKind, PipelineGuard, StatusReporter};
use atlas_core::indexer::IncrementalIndexer;
use atlas_core::manifest::{ChangeManifest, IndexManifest, Invalidator};
use atlas_core::retriever::Retriever;
use atlas_core::store::files::FileUnitStore;
use atlas_core::store::memory::{InMemoryGraphStore, InMemoryMetadataStore, InMemoryVectorStore};
use atlas_core::store::sqlite::SqliteStore;
use atlas_core::store::{GraphStore, MetadataStore, SearchField, VectorStore};
use atlas_core::types::{ExtractedUnit, UnitType};

use crate::server::{ParamKind, ParamSpec, ToolServer, ToolSpec};

/// Shared state all tool handlers close over.
pub struct ServerState {
    /// Index directory holding unit files, manifests, and guard state.
    pub index_dir: PathBuf,
    /// Vector store handle.
    pub vector: Arc<dyn VectorStore>,
    /// Metadata store handle.
    pub metadata: Arc<dyn MetadataStore>,
    /// Graph store handle.
    pub graph: Arc<dyn GraphStore>,
    /// Embedding provider.
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// The retrieval façade.
    pub retriever: Arc<Retriever>,
    /// Per-unit JSON file layout reader.
    pub files: Arc<FileUnitStore>,
    /// Write-side rate limiter; pipeline tools register only when set.
    pub guard: Option<Arc<PipelineGuard>>,
    /// Feedback log; feedback tools register only when set.
    pub feedback: Option<Arc<FeedbackStore>>,
    /// Configured presentation format.
    pub format: OutputFormat,
    /// Response renderer for the configured format.
    pub renderer: Arc<dyn ToolRenderer>,
    /// Status snapshot builder.
    pub status: Arc<StatusReporter>,
}

impl ServerState {
    /// Build state from configuration: stores, embedder, retriever,
    /// guard, and feedback log.
    pub fn from_config(config: &Config) -> AtlasResult<Arc<Self>> {
        let embedder = config.build_embedder()?;
        let files = Arc::new(FileUnitStore::new(&config.index_dir));

        let (vector, metadata, graph): (
            Arc<dyn VectorStore>,
            Arc<dyn MetadataStore>,
            Arc<dyn GraphStore>,
        ) = match config.storage.backend.as_str() {
            "sqlite" => {
                let store = Arc::new(SqliteStore::open(&config.db_path())?);
                (store.clone(), store.clone(), store)
            }
            "memory" => {
                let vector = Arc::new(InMemoryVectorStore::new());
                let metadata = Arc::new(InMemoryMetadataStore::new());
                let graph = Arc::new(InMemoryGraphStore::new());
                files.seed(metadata.as_ref(), graph.as_ref())?;
                (vector, metadata, graph)
            }
            other => {
                return Err(AtlasError::Config {
                    details: format!("unknown storage backend: {other}"),
                })
            }
        };

        let manifest = IndexManifest::load(&config.index_dir)?;
        let retriever = Arc::new(Retriever::new(
            vector.clone(),
            metadata.clone(),
            graph.clone(),
            embedder.clone(),
            manifest.as_ref(),
            config.retrieval.token_budget,
        ));

        let status = Arc::new(StatusReporter::new(
            &config.index_dir,
            metadata.clone(),
            vector.clone(),
        ));

        Ok(Arc::new(Self {
            index_dir: config.index_dir.clone(),
            vector,
            metadata,
            graph,
            embedder,
            retriever,
            files,
            guard: Some(Arc::new(PipelineGuard::new(
                &config.index_dir,
                config.pipeline.cooldown(),
            ))),
            feedback: Some(Arc::new(FeedbackStore::new(config.feedback_log_path()))),
            format: config.formatter.format,
            renderer: Arc::from(renderer_for(config.formatter.format)),
            status,
        }))
    }
}

/// Wrap a domain value as a rendered response object.
fn respond(state: &ServerState, tool: &str, domain: serde_json::Value) -> serde_json::Value {
    let text = state.renderer.render(tool, &domain);
    serde_json::json!({
        "content": [{"type": "text", "text": text}],
        "data": domain,
    })
}

fn unit_to_json(unit: &ExtractedUnit) -> serde_json::Value {
    serde_json::json!({
        "identifier": unit.identifier,
        "type": unit.unit_type.as_str(),
        "namespace": unit.namespace,
        "file_path": unit.file_path,
        "source_code": unit.source_code,
        "metadata": unit.metadata,
        "dependencies": unit.dependencies.iter().map(|d| serde_json::json!({
            "target": d.target,
            "type": d.dep_type,
            "via": d.via.as_str(),
        })).collect::<Vec<_>>(),
        "chunks": unit.chunks.len(),
    })
}

fn str_param<'a>(params: &'a serde_json::Value, name: &str) -> AtlasResult<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AtlasError::validation(format!("missing required parameter: {name}")))
}

fn usize_param(params: &serde_json::Value, name: &str, default: usize) -> usize {
    params
        .get(name)
        .and_then(serde_json::Value::as_u64)
        .map_or(default, |v| v as usize)
}

fn parse_unit_type(tag: &str) -> AtlasResult<UnitType> {
    UnitType::parse(tag)
        .ok_or_else(|| AtlasError::validation(format!("unknown unit type: {tag}")))
}

/// Build a tool server with the full read-side surface registered.
pub fn build_server(state: &Arc<ServerState>) -> ToolServer {
    let mut server = ToolServer::new();

    register_read_tools(&mut server, state);
    if state.guard.is_some() {
        register_pipeline_tools(&mut server, state);
    }
    if state.feedback.is_some() {
        register_feedback_tools(&mut server, state);
    }
    register_resource_tool(&mut server, state);

    tracing::info!(tools = server.tool_names().len(), "tool server built");
    server
}

// ---------------------------------------------------------------------------
// Read-side tools
// ---------------------------------------------------------------------------

fn register_read_tools(server: &mut ToolServer, state: &Arc<ServerState>) {
    // lookup
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "lookup",
            description: "Fetch one unit by its exact identifier",
            params: vec![ParamSpec::required("identifier", ParamKind::String)],
        },
        move |params| {
            let identifier = str_param(params, "identifier")?;
            let unit = s
                .metadata
                .find(identifier)?
                .ok_or_else(|| AtlasError::NotFound { entity: identifier.to_string() })?;
            Ok(respond(&s, "lookup", unit_to_json(&unit)))
        },
    );

    // search
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "search",
            description: "Substring search across identifiers, paths, source, and metadata",
            params: vec![
                ParamSpec::required("query", ParamKind::String),
                ParamSpec::optional("type", ParamKind::String),
                ParamSpec::optional("limit", ParamKind::Integer),
            ],
        },
        move |params| {
            let query = str_param(params, "query")?;
            let limit = usize_param(params, "limit", 10);
            let type_filter = match params.get("type").and_then(|v| v.as_str()) {
                Some(tag) => Some(parse_unit_type(tag)?),
                None => None,
            };

            let matches = s.metadata.search(query, &SearchField::ALL, limit.max(1))?;
            let results: Vec<serde_json::Value> = matches
                .iter()
                .filter(|m| type_filter.map_or(true, |t| m.unit.unit_type == t))
                .map(|m| {
                    serde_json::json!({
                        "identifier": m.unit.identifier,
                        "type": m.unit.unit_type.as_str(),
                        "file_path": m.unit.file_path,
                    })
                })
                .collect();
            Ok(respond(
                &s,
                "search",
                serde_json::json!({"query": query, "count": results.len(), "results": results}),
            ))
        },
    );

    // dependencies / dependents
    for (name, outgoing) in [("dependencies", true), ("dependents", false)] {
        let s = state.clone();
        server.register(
            ToolSpec {
                name: if outgoing { "dependencies" } else { "dependents" },
                description: if outgoing {
                    "Outgoing dependency edges of a unit"
                } else {
                    "Incoming dependency edges of a unit"
                },
                params: vec![ParamSpec::required("identifier", ParamKind::String)],
            },
            move |params| {
                let identifier = str_param(params, "identifier")?;
                let edges = if outgoing {
                    s.graph.dependencies_of(identifier)?
                } else {
                    s.graph.dependents_of(identifier)?
                };
                let listed: Vec<serde_json::Value> = edges
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "source": e.source,
                            "target": e.target,
                            "type": e.dep_type,
                            "via": e.via.as_str(),
                        })
                    })
                    .collect();
                Ok(respond(
                    &s,
                    name,
                    serde_json::json!({"identifier": identifier, "count": listed.len(), "edges": listed}),
                ))
            },
        );
    }

    // structure
    let s = state.clone();
    server.register(
        ToolSpec::nullary("structure", "Unit counts grouped by type"),
        move |_| {
            let counts = s.metadata.counts_by_type()?;
            let total: usize = counts.values().sum();
            let by_type: serde_json::Map<String, serde_json::Value> = counts
                .into_iter()
                .map(|(t, n)| (t.as_str().to_string(), serde_json::json!(n)))
                .collect();
            Ok(respond(
                &s,
                "structure",
                serde_json::json!({"total_units": total, "counts": by_type}),
            ))
        },
    );

    // graph_analysis
    let s = state.clone();
    server.register(
        ToolSpec::nullary("graph_analysis", "Graph size and most-depended-upon units"),
        move |_| {
            let ranks = s.graph.pagerank()?;
            let mut edge_count = 0usize;
            let mut most_depended: Vec<(String, usize)> = Vec::new();
            for id in ranks.keys() {
                edge_count += s.graph.dependencies_of(id)?.len();
                let dependents = s.graph.dependents_of(id)?.len();
                if dependents > 0 {
                    most_depended.push((id.clone(), dependents));
                }
            }
            most_depended.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            most_depended.truncate(5);

            Ok(respond(
                &s,
                "graph_analysis",
                serde_json::json!({
                    "nodes": ranks.len(),
                    "edges": edge_count,
                    "most_depended_upon": most_depended
                        .iter()
                        .map(|(id, n)| serde_json::json!({"identifier": id, "dependents": n}))
                        .collect::<Vec<_>>(),
                }),
            ))
        },
    );

    // pagerank
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "pagerank",
            description: "Top units by PageRank over the dependency graph",
            params: vec![ParamSpec::optional("limit", ParamKind::Integer)],
        },
        move |params| {
            let limit = usize_param(params, "limit", 10);
            let ranks = s.graph.pagerank()?;
            let mut sorted: Vec<(String, f64)> = ranks.into_iter().collect();
            sorted.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            sorted.truncate(limit);
            Ok(respond(
                &s,
                "pagerank",
                serde_json::json!({
                    "ranks": sorted
                        .iter()
                        .map(|(id, score)| serde_json::json!({"identifier": id, "score": score}))
                        .collect::<Vec<_>>(),
                }),
            ))
        },
    );

    // framework
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "framework",
            description: "Search vendored framework source units",
            params: vec![
                ParamSpec::required("query", ParamKind::String),
                ParamSpec::optional("limit", ParamKind::Integer),
            ],
        },
        move |params| {
            let query = str_param(params, "query")?;
            let limit = usize_param(params, "limit", 10);
            let matches = s.metadata.search(query, &SearchField::ALL, limit.max(1) * 4)?;
            let results: Vec<serde_json::Value> = matches
                .iter()
                .filter(|m| m.unit.unit_type == UnitType::RailsSource)
                .take(limit)
                .map(|m| {
                    serde_json::json!({
                        "identifier": m.unit.identifier,
                        "type": m.unit.unit_type.as_str(),
                        "file_path": m.unit.file_path,
                    })
                })
                .collect();
            Ok(respond(
                &s,
                "framework",
                serde_json::json!({"query": query, "count": results.len(), "results": results}),
            ))
        },
    );

    // recent_changes
    let s = state.clone();
    server.register(
        ToolSpec::nullary("recent_changes", "Summary of the last change manifest"),
        move |_| {
            let manifest = ChangeManifest::load(&s.index_dir)?;
            let domain = match manifest {
                Some(m) => serde_json::json!({
                    "generated_at": m.generated_at,
                    "git_sha": m.git_sha,
                    "previous_git_sha": m.previous_git_sha,
                    "summary": m.summary,
                    "added": m.changes.added,
                    "modified": m.changes.modified,
                    "deleted": m.changes.deleted,
                }),
                None => serde_json::json!({"summary": null, "note": "no change manifest yet"}),
            };
            Ok(respond(&s, "recent_changes", domain))
        },
    );

    // reload
    let s = state.clone();
    server.register(
        ToolSpec::nullary("reload", "Re-seed stores from the unit files on disk"),
        move |_| {
            let seeded = s.files.seed(s.metadata.as_ref(), s.graph.as_ref())?;
            let manifest = IndexManifest::load(&s.index_dir)?;
            s.retriever.set_manifest(manifest.as_ref());
            Ok(respond(&s, "reload", serde_json::json!({"seeded": seeded})))
        },
    );

    // codebase_retrieve
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "codebase_retrieve",
            description: "Full retrieval pipeline: classify, search, rank, assemble",
            params: vec![
                ParamSpec::required("query", ParamKind::String),
                ParamSpec::optional("budget", ParamKind::Integer),
            ],
        },
        move |params| {
            let query = str_param(params, "query")?;
            let budget = params.get("budget").and_then(serde_json::Value::as_u64).map(|b| b as usize);
            let result = s.retriever.retrieve(query, budget);
            let rendered = format_context(&result.context, s.format);
            Ok(serde_json::json!({
                "content": [{"type": "text", "text": rendered}],
                "data": {
                    "tokens_used": result.context.tokens_used,
                    "budget": result.context.budget,
                    "strategy": result.strategy.as_str(),
                    "sources": result.context.sources,
                    "degraded": result.degraded,
                    "degradation_reason": result.degradation_reason,
                    "trace": result.trace,
                },
            }))
        },
    );

    // trace_flow
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "trace_flow",
            description: "Follow dependency edges outward from a unit",
            params: vec![
                ParamSpec::required("identifier", ParamKind::String),
                ParamSpec::optional("depth", ParamKind::Integer),
            ],
        },
        move |params| {
            let identifier = str_param(params, "identifier")?;
            let depth = usize_param(params, "depth", 3).min(3);

            let mut visited = std::collections::BTreeSet::new();
            visited.insert(identifier.to_string());
            let mut frontier = vec![identifier.to_string()];
            let mut flow = Vec::new();

            for level in 1..=depth {
                let mut next = Vec::new();
                for from in &frontier {
                    for edge in s.graph.dependencies_of(from)? {
                        flow.push(serde_json::json!({
                            "from": edge.source,
                            "to": edge.target,
                            "via": edge.via.as_str(),
                            "depth": level,
                        }));
                        if visited.insert(edge.target.clone()) {
                            next.push(edge.target);
                        }
                    }
                }
                frontier = next;
                if frontier.is_empty() {
                    break;
                }
            }

            Ok(respond(
                &s,
                "trace_flow",
                serde_json::json!({"identifier": identifier, "edges": flow}),
            ))
        },
    );
}

// ---------------------------------------------------------------------------
// Pipeline tools
// ---------------------------------------------------------------------------

fn register_pipeline_tools(server: &mut ToolServer, state: &Arc<ServerState>) {
    // pipeline_status
    let s = state.clone();
    server.register(
        ToolSpec::nullary("pipeline_status", "Manifest and store health snapshot"),
        move |_| {
            let status = s.status.report();
            let domain = serde_json::to_value(&status)
                .map_err(|e| AtlasError::Serialization(e.to_string()))?;
            Ok(respond(&s, "pipeline_status", domain))
        },
    );

    // pipeline_extract: refresh manifests from the unit files on disk.
    let s = state.clone();
    server.register(
        ToolSpec::nullary("pipeline_extract", "Refresh manifests from extracted unit files"),
        move |_| {
            let Some(guard) = s.guard.as_ref() else {
                return Err(AtlasError::Unsupported { operation: "pipeline_extract".into() });
            };
            if !guard.allows(OperationKind::Extraction)? {
                return Ok(respond(&s, "pipeline_extract", serde_json::json!({"status": "rate-limited"})));
            }
            guard.record(OperationKind::Extraction)?;

            let task_state = s.clone();
            std::thread::spawn(move || {
                if let Err(e) = run_extraction(&task_state) {
                    tracing::error!(error = %e, "background extraction failed");
                }
            });

            Ok(respond(&s, "pipeline_extract", serde_json::json!({"status": "started"})))
        },
    );

    // pipeline_embed: reconcile the vector store from the change manifest.
    let s = state.clone();
    server.register(
        ToolSpec::nullary("pipeline_embed", "Run the incremental embedding indexer"),
        move |_| {
            let Some(guard) = s.guard.as_ref() else {
                return Err(AtlasError::Unsupported { operation: "pipeline_embed".into() });
            };
            if !guard.allows(OperationKind::Embedding)? {
                return Ok(respond(&s, "pipeline_embed", serde_json::json!({"status": "rate-limited"})));
            }
            guard.record(OperationKind::Embedding)?;

            let task_state = s.clone();
            std::thread::spawn(move || {
                let manifest = match ChangeManifest::load(&task_state.index_dir) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::error!(error = %e, "cannot load change manifest");
                        None
                    }
                };
                let indexer = IncrementalIndexer::new(
                    task_state.vector.clone(),
                    task_state.metadata.clone(),
                    task_state.graph.clone(),
                    task_state.embedder.clone(),
                );
                match indexer.run(manifest.as_ref()) {
                    Ok(outcome) => tracing::info!(
                        embedded = outcome.embedded,
                        deleted = outcome.deleted,
                        skipped = outcome.skipped,
                        "background embed complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "background embed failed"),
                }
            });

            Ok(respond(&s, "pipeline_embed", serde_json::json!({"status": "started"})))
        },
    );

    // pipeline_diagnose
    let s = state.clone();
    server.register(
        ToolSpec::nullary("pipeline_diagnose", "Breaker states, store counts, staleness"),
        move |_| {
            let breakers = s.retriever.breakers();
            let status = s.status.report();
            Ok(respond(
                &s,
                "pipeline_diagnose",
                serde_json::json!({
                    "status": status.status,
                    "staleness_seconds": status.staleness_seconds,
                    "breakers": {
                        "vector": breakers.vector.state().as_str(),
                        "metadata": breakers.metadata.state().as_str(),
                        "graph": breakers.graph.state().as_str(),
                    },
                    "units": status.total_units,
                    "vectors": status.vectors,
                }),
            ))
        },
    );

    // pipeline_repair
    let s = state.clone();
    server.register(
        ToolSpec::nullary("pipeline_repair", "Reset breakers and re-seed from disk"),
        move |_| {
            let breakers = s.retriever.breakers();
            breakers.vector.reset();
            breakers.metadata.reset();
            breakers.graph.reset();
            let seeded = s.files.seed(s.metadata.as_ref(), s.graph.as_ref())?;
            let manifest = IndexManifest::load(&s.index_dir)?;
            s.retriever.set_manifest(manifest.as_ref());
            Ok(respond(
                &s,
                "pipeline_repair",
                serde_json::json!({
                    "actions": ["breakers_reset", "stores_reseeded"],
                    "seeded": seeded,
                }),
            ))
        },
    );
}

/// Background extraction: reload units, rewrite the manifests and the
/// serialized dependency graph.
fn run_extraction(state: &ServerState) -> AtlasResult<()> {
    let units = state.files.load_units()?;
    for unit in &units {
        state.metadata.store(unit)?;
        state.graph.register(unit)?;
    }

    let mut dep_graph = atlas_core::graph::DependencyGraph::new();
    for unit in &units {
        dep_graph.register(unit);
    }
    atlas_core::manifest::write_json_atomic(
        &state.index_dir.join(atlas_core::manifest::GRAPH_FILE),
        &dep_graph.to_value(),
    )?;

    let previous = ChangeManifest::load(&state.index_dir)?;
    let previous_manifest = IndexManifest::load(&state.index_dir)?;
    let git_sha = previous_manifest
        .as_ref()
        .map_or_else(|| "unknown".to_string(), |m| m.git_sha.clone());
    let git_branch = previous_manifest
        .as_ref()
        .map_or_else(|| "unknown".to_string(), |m| m.git_branch.clone());

    let change = Invalidator::diff(&units, previous.as_ref(), &git_sha);
    change.write(&state.index_dir)?;

    let manifest = IndexManifest::from_units(&units, &git_sha, &git_branch, "ruby", None);
    manifest.write(&state.index_dir)?;
    state.retriever.set_manifest(Some(&manifest));

    tracing::info!(
        units = units.len(),
        added = change.summary.added,
        modified = change.summary.modified,
        deleted = change.summary.deleted,
        "extraction refresh complete"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Feedback tools
// ---------------------------------------------------------------------------

fn register_feedback_tools(server: &mut ToolServer, state: &Arc<ServerState>) {
    // retrieval_rate
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "retrieval_rate",
            description: "Rate a retrieval 1-5",
            params: vec![
                ParamSpec::required("query", ParamKind::String),
                ParamSpec::required("score", ParamKind::Integer),
                ParamSpec::optional("comment", ParamKind::String),
            ],
        },
        move |params| {
            let Some(feedback) = s.feedback.as_ref() else {
                return Err(AtlasError::Unsupported { operation: "retrieval_rate".into() });
            };
            let query = str_param(params, "query")?;
            let score = params
                .get("score")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| AtlasError::validation("missing required parameter: score"))?;
            let score = u8::try_from(score)
                .map_err(|_| AtlasError::validation(format!("score must be between 1 and 5, got {score}")))?;
            let comment = params.get("comment").and_then(|v| v.as_str());
            feedback.rate(query, score, comment)?;
            Ok(respond(&s, "retrieval_rate", serde_json::json!({"recorded": true})))
        },
    );

    // report_gap
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "report_gap",
            description: "Report a unit missing from retrieval results",
            params: vec![
                ParamSpec::required("query", ParamKind::String),
                ParamSpec::required("missing_unit", ParamKind::String),
                ParamSpec::required("unit_type", ParamKind::String),
            ],
        },
        move |params| {
            let Some(feedback) = s.feedback.as_ref() else {
                return Err(AtlasError::Unsupported { operation: "report_gap".into() });
            };
            feedback.report_gap(
                str_param(params, "query")?,
                str_param(params, "missing_unit")?,
                str_param(params, "unit_type")?,
            )?;
            Ok(respond(&s, "report_gap", serde_json::json!({"recorded": true})))
        },
    );

    // retrieval_explain
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "retrieval_explain",
            description: "Classification, strategy, and trace for a query",
            params: vec![ParamSpec::required("query", ParamKind::String)],
        },
        move |params| {
            let query = str_param(params, "query")?;
            let result = s.retriever.retrieve(query, None);
            Ok(respond(
                &s,
                "retrieval_explain",
                serde_json::json!({
                    "classification": result.classification,
                    "strategy": result.strategy.as_str(),
                    "degraded": result.degraded,
                    "trace": result.trace,
                }),
            ))
        },
    );

    // retrieval_suggest
    let s = state.clone();
    server.register(
        ToolSpec::nullary("retrieval_suggest", "Recurring issues mined from feedback"),
        move |_| {
            let Some(feedback) = s.feedback.as_ref() else {
                return Err(AtlasError::Unsupported { operation: "retrieval_suggest".into() });
            };
            let issues = GapDetector::new().detect(feedback)?;
            Ok(respond(
                &s,
                "retrieval_suggest",
                serde_json::json!({
                    "issue_count": issues.len(),
                    "issues": issues,
                    "average_score": feedback.average_score()?,
                }),
            ))
        },
    );
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

fn register_resource_tool(server: &mut ToolServer, state: &Arc<ServerState>) {
    let s = state.clone();
    server.register(
        ToolSpec {
            name: "resource",
            description: "Read a codebase:// resource URI",
            params: vec![ParamSpec::required("uri", ParamKind::String)],
        },
        move |params| {
            let uri = str_param(params, "uri")?;
            let Some(path) = uri.strip_prefix("codebase://") else {
                return Err(AtlasError::validation(format!("unsupported resource URI: {uri}")));
            };

            let domain = match path {
                "manifest" => {
                    let manifest = IndexManifest::load(&s.index_dir)?
                        .ok_or_else(|| AtlasError::NotFound { entity: uri.to_string() })?;
                    serde_json::to_value(&manifest)
                        .map_err(|e| AtlasError::Serialization(e.to_string()))?
                }
                "graph" => {
                    let ranks = s.graph.pagerank()?;
                    let mut nodes = serde_json::Map::new();
                    for id in ranks.keys() {
                        let deps: Vec<serde_json::Value> = s
                            .graph
                            .dependencies_of(id)?
                            .iter()
                            .map(|e| serde_json::json!({"target": e.target, "via": e.via.as_str()}))
                            .collect();
                        nodes.insert(id.clone(), serde_json::json!(deps));
                    }
                    serde_json::Value::Object(nodes)
                }
                other => {
                    if let Some(identifier) = other.strip_prefix("unit/") {
                        let unit = s.metadata.find(identifier)?.ok_or_else(|| {
                            AtlasError::NotFound { entity: identifier.to_string() }
                        })?;
                        unit_to_json(&unit)
                    } else if let Some(tag) = other.strip_prefix("type/") {
                        let unit_type = parse_unit_type(tag)?;
                        let units = s.metadata.find_by_type(unit_type)?;
                        serde_json::json!({
                            "type": tag,
                            "count": units.len(),
                            "identifiers": units.iter().map(|u| u.identifier.clone()).collect::<Vec<_>>(),
                        })
                    } else {
                        return Err(AtlasError::validation(format!(
                            "unsupported resource URI: {uri}"
                        )));
                    }
                }
            };

            Ok(respond(&s, "resource", domain))
        },
    );
}
