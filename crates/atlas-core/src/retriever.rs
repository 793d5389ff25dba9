//! The retrieval façade.
//!
//! Orchestrates Classifier -> Executor -> Ranker -> Assembler and
//! emits a [`RetrievalResult`] with a full stage trace. Store calls
//! run behind per-backend circuit breakers; a failing backend drops
//! the pipeline to a lower tier instead of aborting:
//!
//! - Tier 1: the strategy the classification selects
//! - Tier 2 (vector down): keyword + graph union
//! - Tier 3 (metadata down): graph only
//! - Tier 4 (graph down): direct lookup of keyword-derived ids
//!
//! The retriever is read-only and reentrant; concurrent callers share
//! the store handles.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::assembler::ContextAssembler;
use crate::breaker::CircuitBreaker;
use crate::classifier::QueryClassifier;
use crate::embedder::EmbeddingProvider;
use crate::error::{AtlasError, StoreBackend};
use crate::executor::{ExecutionResult, SearchExecutor, DEFAULT_LIMIT};
use crate::manifest::IndexManifest;
use crate::ranker::{RankedCandidate, Ranker};
use crate::store::{GraphStore, MetadataStore, VectorStore};
use crate::types::{
    AssembledContext, Candidate, Classification, RetrievalResult, RetrievalTrace, StageEvent,
    StageStatus, Strategy,
};

/// Per-backend breakers shared by one retriever.
pub struct RetrieverBreakers {
    /// Guards vector-store and embedding calls.
    pub vector: CircuitBreaker,
    /// Guards metadata-store calls.
    pub metadata: CircuitBreaker,
    /// Guards graph-store calls.
    pub graph: CircuitBreaker,
}

impl RetrieverBreakers {
    /// Breakers with default threshold and reset timeout.
    pub fn with_defaults() -> Self {
        Self {
            vector: CircuitBreaker::with_defaults("vector"),
            metadata: CircuitBreaker::with_defaults("metadata"),
            graph: CircuitBreaker::with_defaults("graph"),
        }
    }
}

/// Read-path façade over the whole retrieval pipeline.
pub struct Retriever {
    executor: SearchExecutor,
    ranker: Ranker,
    breakers: RetrieverBreakers,
    default_budget: usize,
    /// Structural overview derived from the manifest; refreshed on reload.
    structural: RwLock<Option<String>>,
}

impl Retriever {
    /// Build a retriever over shared store handles.
    pub fn new(
        vector: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        manifest: Option<&IndexManifest>,
        default_budget: usize,
    ) -> Self {
        Self {
            executor: SearchExecutor::new(vector, metadata.clone(), graph, embedder),
            ranker: Ranker::new(metadata),
            breakers: RetrieverBreakers::with_defaults(),
            default_budget,
            structural: RwLock::new(manifest.map(IndexManifest::structural_overview)),
        }
    }

    /// The default budget used when the caller passes none.
    pub fn default_budget(&self) -> usize {
        self.default_budget
    }

    /// Replace the structural overview after a manifest reload.
    pub fn set_manifest(&self, manifest: Option<&IndexManifest>) {
        *self.structural.write() = manifest.map(IndexManifest::structural_overview);
    }

    /// Breaker states, for diagnostics.
    pub fn breakers(&self) -> &RetrieverBreakers {
        &self.breakers
    }

    /// Run the full pipeline for a query.
    pub fn retrieve(&self, query: &str, budget: Option<usize>) -> RetrievalResult {
        let budget = budget.unwrap_or(self.default_budget);
        let start = Instant::now();
        let mut trace = RetrievalTrace::default();
        let mut degradation_reason: Option<String> = None;

        // Stage 1: classify (pure, cannot fail).
        let classification = QueryClassifier::classify(query);
        trace.push(stage_ok(
            "classify",
            start,
            [("keywords", classification.keywords.len())],
            [
                ("intent", serde_json::json!(classification.intent)),
                ("scope", serde_json::json!(classification.scope)),
            ],
        ));

        // Stage 2: search, degrading tier by tier.
        let (execution, search_status) =
            self.execute_tiered(&classification, query, &mut degradation_reason);
        let score_range = score_range(&execution.candidates);
        trace.push(StageEvent {
            stage: "search".into(),
            status: search_status,
            elapsed_ms: start.elapsed().as_millis() as u64,
            counts: BTreeMap::from([("candidates".to_string(), execution.candidates.len())]),
            extra: BTreeMap::from([
                ("strategy".to_string(), serde_json::json!(execution.strategy.as_str())),
                ("score_range".to_string(), serde_json::json!(score_range)),
            ]),
        });

        // Stage 3: rank.
        let (ranked, rank_status) = match self
            .breakers
            .metadata
            .call(|| self.ranker.rank(execution.candidates.clone(), &classification))
        {
            Ok(ranked) => (ranked, StageStatus::Ok),
            Err(err) => {
                note_degradation(&mut degradation_reason, &format!("ranking degraded: {err}"));
                (rank_without_records(&execution.candidates), StageStatus::Degraded)
            }
        };
        trace.push(stage_with_status(
            "rank",
            rank_status,
            start,
            [("ranked", ranked.len())],
            [],
        ));

        // Stage 4: assemble.
        let structural = self.structural.read().clone();
        let assembler = ContextAssembler::new(budget);
        let context = assembler.assemble(&ranked, &classification, structural.as_deref());
        trace.push(stage_ok(
            "assemble",
            start,
            [("emitted", context.sources.len()), ("tokens_used", context.tokens_used)],
            [],
        ));

        if context.sources.is_empty() && !ranked.is_empty() && degradation_reason.is_some() {
            note_degradation(
                &mut degradation_reason,
                "no unit records could be materialized for the assembled context",
            );
        }

        trace.total_ms = start.elapsed().as_millis() as u64;
        let degraded = trace.degraded;

        RetrievalResult {
            context,
            strategy: execution.strategy,
            classification,
            trace,
            degraded,
            degradation_reason,
        }
    }

    /// Run the pipeline and render the context through a caller-provided
    /// formatter callback.
    pub fn retrieve_with<F>(
        &self,
        query: &str,
        budget: Option<usize>,
        formatter: F,
    ) -> (RetrievalResult, String)
    where
        F: Fn(&AssembledContext) -> String,
    {
        let result = self.retrieve(query, budget);
        let rendered = formatter(&result.context);
        (result, rendered)
    }

    // -----------------------------------------------------------------
    // Degradation ladder
    // -----------------------------------------------------------------

    fn execute_tiered(
        &self,
        classification: &Classification,
        query: &str,
        degradation_reason: &mut Option<String>,
    ) -> (ExecutionResult, StageStatus) {
        let strategy = SearchExecutor::select_strategy(classification);
        let breaker = self.breaker_for(strategy);

        match breaker.call(|| self.executor.execute(classification, query, DEFAULT_LIMIT)) {
            Ok(execution) => (execution, StageStatus::Ok),
            Err(err) => {
                let tier = first_fallback_tier(&err);
                note_degradation(degradation_reason, &format!("{strategy} strategy failed: {err}"));
                tracing::warn!(strategy = %strategy, error = %err, tier, "search degraded");
                (self.run_tier(tier, classification, query, degradation_reason), StageStatus::Degraded)
            }
        }
    }

    /// Run a fallback tier, continuing to lower tiers as needed.
    fn run_tier(
        &self,
        tier: u8,
        classification: &Classification,
        query: &str,
        degradation_reason: &mut Option<String>,
    ) -> ExecutionResult {
        if tier <= 2 {
            // Tier 2: keyword + graph union.
            let keyword = self
                .breakers
                .metadata
                .call(|| self.executor.run_keyword(classification, DEFAULT_LIMIT));
            let graph = self.breakers.graph.call(|| self.executor.run_graph(classification));

            match (keyword, graph) {
                (Ok(mut candidates), Ok(graph_candidates)) => {
                    candidates.extend(graph_candidates);
                    return ExecutionResult {
                        candidates,
                        strategy: Strategy::Keyword,
                        query: query.to_string(),
                    };
                }
                (Err(err), Ok(candidates)) => {
                    // Metadata down: graph-only is exactly tier 3.
                    note_degradation(degradation_reason, &format!("keyword arm failed: {err}"));
                    return ExecutionResult {
                        candidates,
                        strategy: Strategy::Graph,
                        query: query.to_string(),
                    };
                }
                (Ok(candidates), Err(err)) => {
                    note_degradation(degradation_reason, &format!("graph arm failed: {err}"));
                    return ExecutionResult {
                        candidates,
                        strategy: Strategy::Keyword,
                        query: query.to_string(),
                    };
                }
                (Err(keyword_err), Err(graph_err)) => {
                    note_degradation(
                        degradation_reason,
                        &format!("keyword and graph arms failed: {keyword_err}; {graph_err}"),
                    );
                    return self.run_tier(4, classification, query, degradation_reason);
                }
            }
        }

        if tier == 3 {
            match self.breakers.graph.call(|| self.executor.run_graph(classification)) {
                Ok(candidates) => {
                    return ExecutionResult {
                        candidates,
                        strategy: Strategy::Graph,
                        query: query.to_string(),
                    }
                }
                Err(err) => {
                    note_degradation(degradation_reason, &format!("graph tier failed: {err}"));
                    return self.run_tier(4, classification, query, degradation_reason);
                }
            }
        }

        // Tier 4: direct lookup of keyword-derived identifiers.
        match self.breakers.metadata.call(|| self.executor.run_direct(classification)) {
            Ok(candidates) => ExecutionResult {
                candidates,
                strategy: Strategy::Direct,
                query: query.to_string(),
            },
            Err(err) => {
                note_degradation(degradation_reason, &format!("direct tier failed: {err}"));
                ExecutionResult {
                    candidates: Vec::new(),
                    strategy: Strategy::Direct,
                    query: query.to_string(),
                }
            }
        }
    }

    fn breaker_for(&self, strategy: Strategy) -> &CircuitBreaker {
        match strategy {
            Strategy::Vector | Strategy::Hybrid => &self.breakers.vector,
            Strategy::Keyword | Strategy::Direct => &self.breakers.metadata,
            Strategy::Graph => &self.breakers.graph,
        }
    }
}

/// Which tier a tier-1 failure drops to, by failing backend.
fn first_fallback_tier(err: &AtlasError) -> u8 {
    match err {
        AtlasError::Store { backend: StoreBackend::Vector, .. }
        | AtlasError::Embedding { .. }
        | AtlasError::DimensionMismatch { .. } => 2,
        AtlasError::Store { backend: StoreBackend::Metadata, .. } => 3,
        AtlasError::Store { backend: StoreBackend::Graph, .. } => 4,
        AtlasError::CircuitOpen { backend } => match backend.as_str() {
            "metadata" => 3,
            "graph" => 4,
            _ => 2,
        },
        _ => 2,
    }
}

/// Fallback ranking when the metadata store cannot be reached: fused
/// scores only, no record materialization.
fn rank_without_records(candidates: &[Candidate]) -> Vec<RankedCandidate> {
    let mut seen = std::collections::BTreeSet::new();
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .filter(|c| seen.insert(c.identifier.clone()))
        .map(|c| RankedCandidate {
            identifier: c.identifier.clone(),
            score: c.score,
            source: c.source,
            metadata: c.metadata.clone(),
            unit: None,
            signals: crate::ranker::SignalBreakdown {
                semantic: c.score,
                ..Default::default()
            },
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    ranked
}

fn note_degradation(reason: &mut Option<String>, note: &str) {
    match reason {
        Some(existing) => {
            existing.push_str("; ");
            existing.push_str(note);
        }
        None => *reason = Some(note.to_string()),
    }
}

fn score_range(candidates: &[Candidate]) -> Option<(f64, f64)> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for c in candidates {
        min = min.min(c.score);
        max = max.max(c.score);
    }
    if candidates.is_empty() {
        None
    } else {
        Some((min, max))
    }
}

fn stage_ok<const N: usize, const M: usize>(
    stage: &str,
    start: Instant,
    counts: [(&str, usize); N],
    extra: [(&str, serde_json::Value); M],
) -> StageEvent {
    stage_with_status(stage, StageStatus::Ok, start, counts, extra)
}

fn stage_with_status<const N: usize, const M: usize>(
    stage: &str,
    status: StageStatus,
    start: Instant,
    counts: [(&str, usize); N],
    extra: [(&str, serde_json::Value); M],
) -> StageEvent {
    StageEvent {
        stage: stage.to_string(),
        status,
        elapsed_ms: start.elapsed().as_millis() as u64,
        counts: counts.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        extra: extra.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    }
}
