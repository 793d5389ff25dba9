//! In-memory store backends.
//!
//! The default backends for tests and file-seeded deployments. All
//! three are RwLock-protected maps; reads are concurrent, writes take
//! the lock briefly and never across another call.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::graph::{DependencyGraph, GraphEdge};
use crate::store::{
    FieldMatch, Filters, GraphStore, MetadataStore, SearchField, StoreResult, VectorHit,
    VectorStore,
};
use crate::types::{ExtractedUnit, Metadata, UnitType};

/// Returns true when every filter key is present in `metadata` with an
/// equal value (equality-only AND semantics).
pub(crate) fn matches_filters(metadata: &Metadata, filters: &Filters) -> bool {
    filters.iter().all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Cosine similarity mapped into [0, 1].
pub(crate) fn cosine_score(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    ((1.0 + cosine) / 2.0).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// Flat in-memory vector store with exact cosine search.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<BTreeMap<String, (Vec<f32>, Metadata)>>,
}

impl InMemoryVectorStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn store(&self, id: &str, vector: &[f32], metadata: &Metadata) -> StoreResult<()> {
        self.entries
            .write()
            .insert(id.to_string(), (vector.to_vec(), metadata.clone()));
        Ok(())
    }

    fn search(&self, query: &[f32], limit: usize, filters: &Filters) -> StoreResult<Vec<VectorHit>> {
        let entries = self.entries.read();
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, (_, metadata))| matches_filters(metadata, filters))
            .map(|(id, (vector, metadata))| VectorHit {
                id: id.clone(),
                score: cosine_score(query, vector),
                metadata: metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.entries.write().remove(id).is_some())
    }

    fn delete_by_filter(&self, filters: &Filters) -> StoreResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, metadata)| !matches_filters(metadata, filters));
        Ok(before - entries.len())
    }

    fn count(&self) -> StoreResult<usize> {
        Ok(self.entries.read().len())
    }
}

// ---------------------------------------------------------------------------
// Metadata store
// ---------------------------------------------------------------------------

/// In-memory unit-record store.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    units: RwLock<BTreeMap<String, ExtractedUnit>>,
}

impl InMemoryMetadataStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Which requested field (in priority order) contains the query.
    fn matched_field(unit: &ExtractedUnit, needle: &str, fields: &[SearchField]) -> Option<SearchField> {
        for field in SearchField::ALL {
            if !fields.contains(&field) {
                continue;
            }
            let haystack = match field {
                SearchField::Identifier => unit.identifier.to_lowercase(),
                SearchField::FilePath => unit.file_path.to_lowercase(),
                SearchField::SourceCode => {
                    unit.source_code.as_deref().unwrap_or("").to_lowercase()
                }
                SearchField::MetadataJson => serde_json::to_string(&unit.metadata)
                    .unwrap_or_default()
                    .to_lowercase(),
            };
            if haystack.contains(needle) {
                return Some(field);
            }
        }
        None
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn store(&self, unit: &ExtractedUnit) -> StoreResult<()> {
        self.units.write().insert(unit.identifier.clone(), unit.clone());
        Ok(())
    }

    fn find(&self, id: &str) -> StoreResult<Option<ExtractedUnit>> {
        Ok(self.units.read().get(id).cloned())
    }

    fn find_batch(&self, ids: &[String]) -> StoreResult<BTreeMap<String, ExtractedUnit>> {
        let units = self.units.read();
        Ok(ids
            .iter()
            .filter_map(|id| units.get(id).map(|u| (id.clone(), u.clone())))
            .collect())
    }

    fn find_by_type(&self, unit_type: UnitType) -> StoreResult<Vec<ExtractedUnit>> {
        Ok(self
            .units
            .read()
            .values()
            .filter(|u| u.unit_type == unit_type)
            .cloned()
            .collect())
    }

    fn search(
        &self,
        query: &str,
        fields: &[SearchField],
        limit: usize,
    ) -> StoreResult<Vec<FieldMatch>> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let units = self.units.read();
        let mut matches = Vec::new();
        for unit in units.values() {
            if let Some(field) = Self::matched_field(unit, &needle, fields) {
                matches.push(FieldMatch { unit: unit.clone(), field });
                if matches.len() >= limit {
                    break;
                }
            }
        }
        Ok(matches)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        Ok(self.units.write().remove(id).is_some())
    }

    fn count(&self) -> StoreResult<usize> {
        Ok(self.units.read().len())
    }

    fn all_identifiers(&self) -> StoreResult<Vec<String>> {
        Ok(self.units.read().keys().cloned().collect())
    }

    fn counts_by_type(&self) -> StoreResult<BTreeMap<UnitType, usize>> {
        let units = self.units.read();
        let mut counts = BTreeMap::new();
        for unit in units.values() {
            *counts.entry(unit.unit_type).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Graph store
// ---------------------------------------------------------------------------

/// In-memory graph store over the serializable [`DependencyGraph`].
#[derive(Default)]
pub struct InMemoryGraphStore {
    graph: RwLock<DependencyGraph>,
}

impl InMemoryGraphStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an existing graph (e.g. loaded from disk).
    pub fn from_graph(graph: DependencyGraph) -> Self {
        Self { graph: RwLock::new(graph) }
    }

    /// Snapshot the underlying graph (for serialization).
    pub fn snapshot(&self) -> DependencyGraph {
        self.graph.read().clone()
    }
}

impl GraphStore for InMemoryGraphStore {
    fn register(&self, unit: &ExtractedUnit) -> StoreResult<()> {
        self.graph.write().register(unit);
        Ok(())
    }

    fn dependencies_of(&self, id: &str) -> StoreResult<Vec<GraphEdge>> {
        Ok(self.graph.read().dependencies_of(id))
    }

    fn dependents_of(&self, id: &str) -> StoreResult<Vec<GraphEdge>> {
        Ok(self.graph.read().dependents_of(id))
    }

    fn by_type(&self, unit_type: UnitType) -> StoreResult<Vec<String>> {
        Ok(self.graph.read().by_type(unit_type))
    }

    fn affected_by(&self, paths: &[String]) -> StoreResult<Vec<String>> {
        Ok(self.graph.read().affected_by(paths))
    }

    fn pagerank(&self) -> StoreResult<BTreeMap<String, f64>> {
        Ok(self.graph.read().pagerank())
    }

    fn unregister(&self, id: &str) -> StoreResult<bool> {
        Ok(self.graph.write().unregister(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(id: &str, unit_type: UnitType, source: &str) -> ExtractedUnit {
        let mut u = ExtractedUnit::new(unit_type, id, format!("app/{}.rb", id.to_lowercase()));
        u.source_code = Some(source.to_string());
        u
    }

    #[test]
    fn test_vector_store_upsert_and_search() {
        let store = InMemoryVectorStore::new();
        let mut meta = Metadata::new();
        meta.insert("type".into(), json!("model"));

        store.store("User", &[1.0, 0.0], &meta).expect("store");
        store.store("Post", &[0.0, 1.0], &meta).expect("store");
        // Upsert replaces in place.
        store.store("User", &[0.9, 0.1], &meta).expect("re-store");
        assert_eq!(store.count().expect("count"), 2);

        let hits = store.search(&[1.0, 0.0], 10, &Filters::new()).expect("search");
        assert_eq!(hits[0].id, "User");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[test]
    fn test_vector_store_filters_and_delete_by_filter() {
        let store = InMemoryVectorStore::new();
        let mut model_meta = Metadata::new();
        model_meta.insert("type".into(), json!("model"));
        let mut job_meta = Metadata::new();
        job_meta.insert("type".into(), json!("job"));

        store.store("User", &[1.0, 0.0], &model_meta).expect("store");
        store.store("NotificationJob", &[1.0, 0.0], &job_meta).expect("store");

        let mut filters = Filters::new();
        filters.insert("type".into(), json!("model"));
        let hits = store.search(&[1.0, 0.0], 10, &filters).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "User");

        let removed = store.delete_by_filter(&filters).expect("delete");
        assert_eq!(removed, 1);
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn test_metadata_search_priority_and_case() {
        let store = InMemoryMetadataStore::new();
        store.store(&unit("User", UnitType::Model, "validates :email")).expect("store");
        store
            .store(&unit("UserRegistration", UnitType::Service, "User.create!(params)"))
            .expect("store");

        let matches = store
            .search("user", &SearchField::ALL, 10)
            .expect("search");
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.field == SearchField::Identifier));

        let matches = store
            .search("VALIDATES", &[SearchField::SourceCode], 10)
            .expect("search");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].unit.identifier, "User");
    }

    #[test]
    fn test_metadata_find_batch_skips_missing() {
        let store = InMemoryMetadataStore::new();
        store.store(&unit("User", UnitType::Model, "")).expect("store");
        let found = store
            .find_batch(&["User".into(), "Ghost".into()])
            .expect("batch");
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("User"));
    }

    #[test]
    fn test_metadata_counts_by_type() {
        let store = InMemoryMetadataStore::new();
        store.store(&unit("User", UnitType::Model, "")).expect("store");
        store.store(&unit("Post", UnitType::Model, "")).expect("store");
        store.store(&unit("PostsController", UnitType::Controller, "")).expect("store");

        let counts = store.counts_by_type().expect("counts");
        assert_eq!(counts.get(&UnitType::Model), Some(&2));
        assert_eq!(counts.get(&UnitType::Controller), Some(&1));
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let store = InMemoryMetadataStore::new();
        store.store(&unit("User", UnitType::Model, "")).expect("store");
        assert!(store.search("", &SearchField::ALL, 10).expect("search").is_empty());
    }

    #[test]
    fn test_cosine_score_bounds() {
        assert!((cosine_score(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine_score(&[1.0, 0.0], &[-1.0, 0.0])).abs() < 1e-9);
        assert!((cosine_score(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-9);
        assert_eq!(cosine_score(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
