//! Strategy selection and execution.
//!
//! Maps a [`Classification`] onto one of five search strategies and
//! runs it against the stores, returning candidates tagged with their
//! source. Candidates are not fused here -- duplicate identifiers
//! across sources are the ranker's input, not a bug.

use std::sync::Arc;

use crate::embedder::EmbeddingProvider;
use crate::error::AtlasResult;
use crate::store::{Filters, MetadataStore, SearchField, VectorStore};
use crate::store::GraphStore;
use crate::types::{
    Candidate, CandidateSource, Classification, Intent, Metadata, Scope, Strategy, UnitType,
};

/// Default candidate limit when the caller does not override it.
pub const DEFAULT_LIMIT: usize = 20;

/// Vector arm size inside the hybrid strategy.
const HYBRID_VECTOR_LIMIT: usize = 15;
/// Keyword arm size inside the hybrid strategy.
const HYBRID_KEYWORD_LIMIT: usize = 10;
/// How many top vector hits seed graph expansion in hybrid.
const HYBRID_EXPANSION_SEEDS: usize = 3;
/// Score assigned to graph-expansion neighbors.
const EXPANSION_SCORE: f64 = 0.75;

/// Result of executing one strategy.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Candidates in strategy emission order, possibly with duplicate
    /// identifiers across sources.
    pub candidates: Vec<Candidate>,
    /// The strategy that actually ran (after direct fall-through).
    pub strategy: Strategy,
    /// The original query.
    pub query: String,
}

/// Dispatches a classification to a search strategy.
pub struct SearchExecutor {
    vector: Arc<dyn VectorStore>,
    metadata: Arc<dyn MetadataStore>,
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SearchExecutor {
    /// Build an executor over shared store handles.
    pub fn new(
        vector: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self { vector, metadata, graph, embedder }
    }

    /// The strategy the selection table picks for a classification.
    ///
    /// A comprehensive or exploratory scope takes the hybrid union even
    /// for trace intents: the graph arm still rides along via expansion
    /// of the top vector hits, and the wide scope asks for more than
    /// edges alone.
    pub fn select_strategy(classification: &Classification) -> Strategy {
        if classification.intent == Intent::Locate && classification.scope == Scope::Pinpoint {
            return Strategy::Direct;
        }
        if matches!(classification.scope, Scope::Comprehensive | Scope::Exploratory) {
            return Strategy::Hybrid;
        }
        if classification.intent == Intent::Trace {
            return Strategy::Graph;
        }
        match classification.intent {
            Intent::Understand | Intent::Debug | Intent::Implement | Intent::Compare => {
                Strategy::Vector
            }
            Intent::Locate | Intent::Reference | Intent::Framework | Intent::Trace => {
                Strategy::Keyword
            }
        }
    }

    /// Execute the selected strategy.
    pub fn execute(
        &self,
        classification: &Classification,
        query: &str,
        limit: usize,
    ) -> AtlasResult<ExecutionResult> {
        let strategy = Self::select_strategy(classification);
        let (candidates, strategy) = match strategy {
            Strategy::Direct => {
                let direct = self.run_direct(classification)?;
                if direct.is_empty() {
                    (self.run_keyword(classification, limit)?, Strategy::Keyword)
                } else {
                    (direct, Strategy::Direct)
                }
            }
            Strategy::Keyword => (self.run_keyword(classification, limit)?, Strategy::Keyword),
            Strategy::Vector => (self.run_vector(classification, query, limit)?, Strategy::Vector),
            Strategy::Graph => (self.run_graph(classification)?, Strategy::Graph),
            Strategy::Hybrid => (self.run_hybrid(classification, query)?, Strategy::Hybrid),
        };

        tracing::debug!(
            strategy = %strategy,
            candidates = candidates.len(),
            "search executed"
        );

        Ok(ExecutionResult { candidates, strategy, query: query.to_string() })
    }

    // -----------------------------------------------------------------
    // Strategies
    // -----------------------------------------------------------------

    /// Exact identifier lookup from keyword-derived guesses.
    pub(crate) fn run_direct(&self, classification: &Classification) -> AtlasResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for id in self.resolve_identifiers(&classification.keywords)? {
            if let Some(unit) = self.metadata.find(&id)? {
                candidates.push(unit_candidate(&id, 1.0, CandidateSource::Direct, &unit.unit_type, &unit.file_path));
            }
        }
        Ok(candidates)
    }

    /// Substring search across record fields, best field wins.
    pub(crate) fn run_keyword(
        &self,
        classification: &Classification,
        limit: usize,
    ) -> AtlasResult<Vec<Candidate>> {
        let mut best: Vec<Candidate> = Vec::new();

        for keyword in &classification.keywords {
            let matches = self.metadata.search(keyword, &SearchField::ALL, limit)?;
            for m in matches {
                if let Some(target) = classification.target_type {
                    if m.unit.unit_type != target {
                        continue;
                    }
                }
                let score = match m.field {
                    SearchField::Identifier => 1.0,
                    SearchField::FilePath => 0.8,
                    SearchField::SourceCode => 0.6,
                    SearchField::MetadataJson => 0.5,
                };
                match best.iter().position(|c| c.identifier == m.unit.identifier) {
                    Some(i) => best[i].score = best[i].score.max(score),
                    None => best.push(unit_candidate(
                        &m.unit.identifier,
                        score,
                        CandidateSource::Keyword,
                        &m.unit.unit_type,
                        &m.unit.file_path,
                    )),
                }
            }
        }

        best.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        best.truncate(limit);
        Ok(best)
    }

    /// Embedding similarity, chunk hits collapsed onto their unit.
    fn run_vector(
        &self,
        classification: &Classification,
        query: &str,
        limit: usize,
    ) -> AtlasResult<Vec<Candidate>> {
        let query_vector = self.embedder.embed(query)?;

        let mut filters = Filters::new();
        if let Some(target) = classification.target_type {
            filters.insert("type".into(), serde_json::json!(target.as_str()));
        }

        let hits = self.vector.search(&query_vector, limit, &filters)?;
        let mut candidates: Vec<Candidate> = Vec::new();
        for hit in hits {
            let identifier = unit_of_vector_id(&hit.id).to_string();
            match candidates.iter().position(|c| c.identifier == identifier) {
                Some(i) => candidates[i].score = candidates[i].score.max(hit.score),
                None => candidates.push(Candidate {
                    identifier,
                    score: hit.score,
                    source: CandidateSource::Vector,
                    metadata: hit.metadata,
                }),
            }
        }
        Ok(candidates)
    }

    /// Graph seeds from keywords plus one-hop expansion.
    pub(crate) fn run_graph(&self, classification: &Classification) -> AtlasResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        let seeds = self.resolve_identifiers(&classification.keywords)?;

        for seed in &seeds {
            candidates.push(Candidate::new(seed.clone(), 1.0, CandidateSource::Graph));

            for edge in self.graph.dependencies_of(seed)? {
                candidates.push(expansion_candidate(&edge.target, &edge.via));
            }
            for edge in self.graph.dependents_of(seed)? {
                candidates.push(expansion_candidate(&edge.source, &edge.via));
            }
        }

        Ok(candidates)
    }

    /// Union of vector, keyword, and graph expansion from top vector hits.
    fn run_hybrid(&self, classification: &Classification, query: &str) -> AtlasResult<Vec<Candidate>> {
        let mut candidates = self.run_vector(classification, query, HYBRID_VECTOR_LIMIT)?;

        let top_vector: Vec<String> = candidates
            .iter()
            .take(HYBRID_EXPANSION_SEEDS)
            .map(|c| c.identifier.clone())
            .collect();

        candidates.extend(self.run_keyword(classification, HYBRID_KEYWORD_LIMIT)?);

        for seed in top_vector {
            for edge in self.graph.dependencies_of(&seed)? {
                candidates.push(expansion_candidate(&edge.target, &edge.via));
            }
            for edge in self.graph.dependents_of(&seed)? {
                candidates.push(expansion_candidate(&edge.source, &edge.via));
            }
        }

        Ok(candidates)
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    /// Keywords are lowercased, so identifier guesses resolve by
    /// case-insensitive equality against stored identifiers, checking
    /// each keyword and the concatenation of all of them.
    fn resolve_identifiers(&self, keywords: &[String]) -> AtlasResult<Vec<String>> {
        let mut guesses: Vec<String> = keywords.to_vec();
        if keywords.len() > 1 {
            guesses.push(keywords.concat());
        }

        let mut resolved = Vec::new();
        for guess in guesses {
            // Cheap path first: the guess may already be the identifier.
            if self.metadata.find(&guess)?.is_some() {
                if !resolved.contains(&guess) {
                    resolved.push(guess);
                }
                continue;
            }
            let matches = self.metadata.search(&guess, &[SearchField::Identifier], 10)?;
            for m in matches {
                if m.unit.identifier.to_lowercase() == guess && !resolved.contains(&m.unit.identifier)
                {
                    resolved.push(m.unit.identifier);
                }
            }
        }
        Ok(resolved)
    }
}

fn unit_candidate(
    identifier: &str,
    score: f64,
    source: CandidateSource,
    unit_type: &UnitType,
    file_path: &str,
) -> Candidate {
    let mut metadata = Metadata::new();
    metadata.insert("type".into(), serde_json::json!(unit_type.as_str()));
    metadata.insert("file_path".into(), serde_json::json!(file_path));
    Candidate { identifier: identifier.to_string(), score, source, metadata }
}

fn expansion_candidate(identifier: &str, via: &crate::types::DependencyVia) -> Candidate {
    let mut candidate =
        Candidate::new(identifier.to_string(), EXPANSION_SCORE, CandidateSource::GraphExpansion);
    candidate.metadata.insert("via".into(), serde_json::json!(via.as_str()));
    candidate
}

/// Strips a `::chunk#...` suffix so chunk hits rank as their unit.
pub fn unit_of_vector_id(vector_id: &str) -> &str {
    match vector_id.find("::chunk#") {
        Some(pos) => &vector_id[..pos],
        None => vector_id,
    }
}
