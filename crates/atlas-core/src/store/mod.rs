//! Polymorphic store contracts.
//!
//! Three narrow persistence surfaces back the retrieval pipeline:
//! vectors, unit metadata, and the dependency graph. Any backend that
//! honors these contracts composes into the pipeline; the crate ships
//! an in-memory backend, an embedded SQLite backend, and a per-unit
//! JSON file loader that seeds the in-memory one.
//!
//! ## Concurrency
//!
//! Traits are synchronous and take `&self`; backends do their own
//! interior locking. The async boundary lives at the tool server, which
//! wraps handlers in blocking tasks (the same shape as a rusqlite
//! engine behind an async mutex).

pub mod files;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::error::{AtlasError, StoreBackend};
use crate::graph::GraphEdge;
use crate::types::{ExtractedUnit, Metadata, UnitType};

/// Equality-only AND filter over metadata keys.
pub type Filters = BTreeMap<String, serde_json::Value>;

/// Typed error raised by a store surface.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The vector store failed.
    #[error("vector store: {message}")]
    Vector {
        /// Human-readable error description.
        message: String,
    },
    /// The metadata store failed.
    #[error("metadata store: {message}")]
    Metadata {
        /// Human-readable error description.
        message: String,
    },
    /// The graph store failed.
    #[error("graph store: {message}")]
    Graph {
        /// Human-readable error description.
        message: String,
    },
}

impl StoreError {
    /// Which surface raised the error.
    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Vector { .. } => StoreBackend::Vector,
            Self::Metadata { .. } => StoreBackend::Metadata,
            Self::Graph { .. } => StoreBackend::Graph,
        }
    }

    /// Shorthand for a vector-store error.
    pub fn vector(message: impl Into<String>) -> Self {
        Self::Vector { message: message.into() }
    }

    /// Shorthand for a metadata-store error.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata { message: message.into() }
    }

    /// Shorthand for a graph-store error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph { message: message.into() }
    }
}

impl From<StoreError> for AtlasError {
    fn from(err: StoreError) -> Self {
        let backend = err.backend();
        AtlasError::store(backend, err.to_string())
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// VectorStore
// ---------------------------------------------------------------------------

/// A single vector search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Stored vector id.
    pub id: String,
    /// Cosine similarity mapped into [0, 1].
    pub score: f64,
    /// The metadata copy stored with the vector.
    pub metadata: Metadata,
}

/// Vector persistence: at most one vector per id, upsert semantics.
pub trait VectorStore: Send + Sync {
    /// Upsert a vector with its filterable metadata copy.
    fn store(&self, id: &str, vector: &[f32], metadata: &Metadata) -> StoreResult<()>;

    /// K-nearest search by cosine similarity, post-filtered by equality
    /// AND over metadata keys. Results are ranked descending, scores in
    /// [0, 1].
    fn search(&self, query: &[f32], limit: usize, filters: &Filters) -> StoreResult<Vec<VectorHit>>;

    /// Delete one vector. Returns whether it existed.
    fn delete(&self, id: &str) -> StoreResult<bool>;

    /// Delete every vector whose metadata matches the filters.
    /// Returns the number removed.
    fn delete_by_filter(&self, filters: &Filters) -> StoreResult<usize>;

    /// Number of stored vectors.
    fn count(&self) -> StoreResult<usize>;
}

// ---------------------------------------------------------------------------
// MetadataStore
// ---------------------------------------------------------------------------

/// Which record field a substring search matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchField {
    /// The unit identifier.
    Identifier,
    /// The repository-relative file path.
    FilePath,
    /// The raw source text.
    SourceCode,
    /// The metadata map serialized as JSON.
    MetadataJson,
}

impl SearchField {
    /// All searchable fields, in match-priority order.
    pub const ALL: [SearchField; 4] =
        [Self::Identifier, Self::FilePath, Self::SourceCode, Self::MetadataJson];
}

/// A metadata search hit with the field that matched.
#[derive(Debug, Clone)]
pub struct FieldMatch {
    /// The matched unit record.
    pub unit: ExtractedUnit,
    /// The first field (in priority order) that contained the query.
    pub field: SearchField,
}

/// Unit-record persistence. The metadata store exclusively owns unit
/// records; dependents are derived and never stored here.
pub trait MetadataStore: Send + Sync {
    /// Upsert a unit record by identifier.
    fn store(&self, unit: &ExtractedUnit) -> StoreResult<()>;

    /// Fetch one record.
    fn find(&self, id: &str) -> StoreResult<Option<ExtractedUnit>>;

    /// Fetch many records; absent ids are simply missing from the map.
    fn find_batch(&self, ids: &[String]) -> StoreResult<BTreeMap<String, ExtractedUnit>>;

    /// All records of one type.
    fn find_by_type(&self, unit_type: UnitType) -> StoreResult<Vec<ExtractedUnit>>;

    /// Case-insensitive substring search across the chosen fields.
    fn search(&self, query: &str, fields: &[SearchField], limit: usize)
        -> StoreResult<Vec<FieldMatch>>;

    /// Delete one record. Returns whether it existed.
    fn delete(&self, id: &str) -> StoreResult<bool>;

    /// Number of stored records.
    fn count(&self) -> StoreResult<usize>;

    /// Every stored identifier (used for full re-embeds).
    fn all_identifiers(&self) -> StoreResult<Vec<String>>;

    /// Record counts grouped by unit type.
    fn counts_by_type(&self) -> StoreResult<BTreeMap<UnitType, usize>>;
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

/// Edge persistence: both directions recorded at registration, reverse
/// edges reconstructed on load rather than stored on units.
pub trait GraphStore: Send + Sync {
    /// Register a unit's node and outgoing edges (recording reverse
    /// adjacency as well).
    fn register(&self, unit: &ExtractedUnit) -> StoreResult<()>;

    /// Outgoing edges from a unit.
    fn dependencies_of(&self, id: &str) -> StoreResult<Vec<GraphEdge>>;

    /// Incoming edges to a unit.
    fn dependents_of(&self, id: &str) -> StoreResult<Vec<GraphEdge>>;

    /// Identifiers of all registered units of one type.
    fn by_type(&self, unit_type: UnitType) -> StoreResult<Vec<String>>;

    /// Identifiers of units whose file path is one of `paths`, plus
    /// their direct dependents.
    fn affected_by(&self, paths: &[String]) -> StoreResult<Vec<String>>;

    /// PageRank over the dependency graph (damping 0.85; 30 iterations
    /// or an L1 fixed point of 1e-6, whichever first).
    fn pagerank(&self) -> StoreResult<BTreeMap<String, f64>>;

    /// Remove a unit's node and all its edges. Returns whether it existed.
    fn unregister(&self, id: &str) -> StoreResult<bool>;
}
