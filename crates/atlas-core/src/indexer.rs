//! Incremental embedding indexer.
//!
//! Consumes a change manifest and reconciles the vector store:
//! re-embeds added and modified units (unit and chunk granularity),
//! deletes vectors and metadata for deleted units, and purges stale
//! chunk vectors before re-embedding a modified unit. Without a
//! manifest it falls back to a full re-embed of every stored unit.
//!
//! Throttles and transient provider failures are retried with capped
//! exponential backoff (base 2s, max 3 retries), then queued to a
//! retry list. A dimension mismatch is fatal: the indexer refuses to
//! write and surfaces a re-index instruction.

use std::sync::Arc;
use std::time::Duration;

use crate::embedder::EmbeddingProvider;
use crate::error::{AtlasError, AtlasResult};
use crate::manifest::ChangeManifest;
use crate::store::{Filters, GraphStore, MetadataStore, VectorStore};
use crate::types::{ExtractedUnit, Metadata};

/// Maximum retries for a throttled or transiently-failing batch.
const MAX_RETRIES: u32 = 3;
/// Base backoff delay, doubled per attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Outcome of one indexer run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IndexOutcome {
    /// Units whose vectors were (re-)written.
    pub embedded: usize,
    /// Units whose vectors and records were removed.
    pub deleted: usize,
    /// Units skipped (missing record or exhausted retries).
    pub skipped: usize,
    /// Identifiers queued for a later retry after exhausted backoff.
    pub retry: Vec<String>,
}

/// Reads a change manifest and reconciles the stores.
pub struct IncrementalIndexer {
    vector: Arc<dyn VectorStore>,
    metadata: Arc<dyn MetadataStore>,
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    backoff_base: Duration,
}

impl IncrementalIndexer {
    /// Build an indexer over shared store handles.
    pub fn new(
        vector: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self { vector, metadata, graph, embedder, backoff_base: BACKOFF_BASE }
    }

    /// Override the backoff base (tests use zero).
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Run the reconciliation.
    pub fn run(&self, manifest: Option<&ChangeManifest>) -> AtlasResult<IndexOutcome> {
        let mut outcome = IndexOutcome::default();

        let to_embed: Vec<String> = match manifest {
            Some(m) => {
                for id in &m.changes.deleted {
                    self.delete_unit(id)?;
                    outcome.deleted += 1;
                }
                // Stale chunk vectors go before re-embedding.
                for id in &m.changes.modified {
                    let mut filters = Filters::new();
                    filters.insert("unit".into(), serde_json::json!(id));
                    filters.insert("granularity".into(), serde_json::json!("chunk"));
                    self.vector.delete_by_filter(&filters)?;
                }
                m.changes.added.iter().chain(m.changes.modified.iter()).cloned().collect()
            }
            None => {
                tracing::warn!("no change manifest; forcing full re-embed");
                self.metadata.all_identifiers()?
            }
        };

        for id in to_embed {
            let Some(unit) = self.metadata.find(&id)? else {
                tracing::warn!(identifier = %id, "manifest names a unit with no record, skipping");
                outcome.skipped += 1;
                continue;
            };

            match self.embed_unit(&unit) {
                Ok(()) => outcome.embedded += 1,
                Err(err @ AtlasError::DimensionMismatch { .. }) => return Err(err),
                Err(AtlasError::Embedding { message, rate_limited }) => {
                    tracing::warn!(
                        identifier = %id,
                        rate_limited,
                        error = %message,
                        "embedding failed after retries, queueing for retry"
                    );
                    outcome.retry.push(id);
                    outcome.skipped += 1;
                }
                Err(err) => {
                    tracing::warn!(identifier = %id, error = %err, "hard failure, skipping unit");
                    outcome.skipped += 1;
                }
            }
        }

        tracing::info!(
            embedded = outcome.embedded,
            deleted = outcome.deleted,
            skipped = outcome.skipped,
            retry = outcome.retry.len(),
            "incremental index complete"
        );
        Ok(outcome)
    }

    /// Remove a deleted unit from every store.
    fn delete_unit(&self, id: &str) -> AtlasResult<()> {
        self.vector.delete(id)?;
        let mut filters = Filters::new();
        filters.insert("unit".into(), serde_json::json!(id));
        self.vector.delete_by_filter(&filters)?;
        self.metadata.delete(id)?;
        self.graph.unregister(id)?;
        tracing::debug!(identifier = %id, "deleted unit from stores");
        Ok(())
    }

    /// Embed a unit and its chunks in one provider batch.
    fn embed_unit(&self, unit: &ExtractedUnit) -> AtlasResult<()> {
        let unit_text = unit.embedding_text();
        let mut texts: Vec<&str> = vec![&unit_text];
        for chunk in &unit.chunks {
            texts.push(&chunk.content);
        }

        let vectors = self.embed_with_backoff(&texts)?;

        let expected = self.embedder.dimensions();
        for vector in &vectors {
            if vector.len() != expected {
                return Err(AtlasError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
        }

        let mut unit_meta = Metadata::new();
        unit_meta.insert("unit".into(), serde_json::json!(unit.identifier));
        unit_meta.insert("type".into(), serde_json::json!(unit.unit_type.as_str()));
        unit_meta.insert("granularity".into(), serde_json::json!("unit"));
        self.vector.store(&unit.identifier, &vectors[0], &unit_meta)?;

        for (chunk, vector) in unit.chunks.iter().zip(vectors.iter().skip(1)) {
            let mut chunk_meta = Metadata::new();
            chunk_meta.insert("unit".into(), serde_json::json!(unit.identifier));
            chunk_meta.insert("type".into(), serde_json::json!(unit.unit_type.as_str()));
            chunk_meta.insert("granularity".into(), serde_json::json!("chunk"));
            chunk_meta.insert("kind".into(), serde_json::json!(chunk.kind.as_str()));
            self.vector.store(&chunk.vector_id(), vector, &chunk_meta)?;
        }

        Ok(())
    }

    /// Embed with capped exponential backoff on throttles and
    /// transient failures.
    fn embed_with_backoff(&self, texts: &[&str]) -> AtlasResult<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            match self.embedder.embed_batch(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(err @ AtlasError::Embedding { .. }) if attempt < MAX_RETRIES => {
                    let delay = self.backoff_base * 2u32.pow(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "embedding batch failed, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
