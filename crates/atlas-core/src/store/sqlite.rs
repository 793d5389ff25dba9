//! Embedded SQLite backend implementing all three store contracts.
//!
//! One connection serves the unit, edge, and embedding tables. SQLite
//! is configured in WAL mode for concurrent reads during writes; the
//! connection itself sits behind a mutex because rusqlite connections
//! are not `Sync`.
//!
//! ## Migrations
//!
//! Schema changes are forward-only numbered migrations tracked in
//! `codebase_index_schema_migrations`. Migrations may add tables,
//! columns, and indexes; they never drop data.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::graph::{DependencyGraph, GraphEdge};
use crate::store::{
    FieldMatch, Filters, GraphStore, MetadataStore, SearchField, StoreError, StoreResult,
    VectorHit, VectorStore,
};
use crate::store::memory::{cosine_score, matches_filters};
use crate::types::{Chunk, Dependency, DependencyVia, ExtractedUnit, Metadata, UnitType};

/// Forward-only numbered migrations. Version numbers are dense and
/// ascending; each runs at most once.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS codebase_units (
             id          TEXT PRIMARY KEY,
             unit_type   TEXT NOT NULL,
             namespace   TEXT NOT NULL DEFAULT '',
             file_path   TEXT NOT NULL,
             source_code TEXT,
             metadata    TEXT NOT NULL DEFAULT '{}',
             created_at  TEXT NOT NULL DEFAULT (datetime('now')),
             updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
         );
         CREATE INDEX IF NOT EXISTS idx_units_type ON codebase_units(unit_type);
         CREATE INDEX IF NOT EXISTS idx_units_path ON codebase_units(file_path);

         CREATE TABLE IF NOT EXISTS codebase_edges (
             source_id    TEXT NOT NULL,
             target_id    TEXT NOT NULL,
             relationship TEXT NOT NULL,
             via          TEXT NOT NULL DEFAULT 'reference',
             UNIQUE(source_id, target_id, relationship)
         );
         CREATE INDEX IF NOT EXISTS idx_edges_source ON codebase_edges(source_id);
         CREATE INDEX IF NOT EXISTS idx_edges_target ON codebase_edges(target_id);

         CREATE TABLE IF NOT EXISTS codebase_embeddings (
             id         TEXT PRIMARY KEY,
             embedding  BLOB NOT NULL,
             metadata   TEXT NOT NULL DEFAULT '{}',
             created_at TEXT NOT NULL DEFAULT (datetime('now')),
             updated_at TEXT NOT NULL DEFAULT (datetime('now'))
         );",
    ),
    // Chunks ride on the unit row; added after the initial schema shipped.
    (
        2,
        "ALTER TABLE codebase_units ADD COLUMN chunks TEXT NOT NULL DEFAULT '[]';",
    ),
];

/// SQLite-backed store implementing the vector, metadata, and graph
/// contracts over one database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path and bring the schema
    /// up to the latest migration.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::metadata(format!("create {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::metadata(format!("open {}: {e}", db_path.display())))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::metadata(e.to_string()))?;

        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests and the embedded console.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Apply any unapplied migrations, in order.
    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS codebase_index_schema_migrations (
                 version    INTEGER PRIMARY KEY,
                 applied_at TEXT NOT NULL DEFAULT (datetime('now'))
             );",
        )
        .map_err(|e| StoreError::metadata(e.to_string()))?;

        for (version, sql) in MIGRATIONS {
            let applied: Option<i64> = conn
                .query_row(
                    "SELECT version FROM codebase_index_schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::metadata(e.to_string()))?;
            if applied.is_some() {
                continue;
            }

            conn.execute_batch(sql)
                .map_err(|e| StoreError::metadata(format!("migration {version}: {e}")))?;
            conn.execute(
                "INSERT INTO codebase_index_schema_migrations (version) VALUES (?1)",
                params![version],
            )
            .map_err(|e| StoreError::metadata(e.to_string()))?;
            tracing::info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// The latest applied migration version (0 when none).
    pub fn schema_version(&self) -> StoreResult<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM codebase_index_schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::metadata(e.to_string()))
    }

    fn row_to_unit(
        id: String,
        unit_type: String,
        namespace: String,
        file_path: String,
        source_code: Option<String>,
        metadata_json: String,
        chunks_json: String,
        dependencies: Vec<Dependency>,
    ) -> StoreResult<ExtractedUnit> {
        let unit_type = UnitType::parse(&unit_type)
            .ok_or_else(|| StoreError::metadata(format!("unknown unit type: {unit_type}")))?;
        let metadata: Metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| StoreError::metadata(format!("metadata for {id}: {e}")))?;
        let chunks: Vec<Chunk> = serde_json::from_str(&chunks_json)
            .map_err(|e| StoreError::metadata(format!("chunks for {id}: {e}")))?;

        Ok(ExtractedUnit {
            unit_type,
            identifier: id,
            namespace,
            file_path,
            source_code,
            metadata,
            dependencies,
            chunks,
        })
    }

    fn dependencies_for(conn: &Connection, id: &str) -> StoreResult<Vec<Dependency>> {
        let mut stmt = conn
            .prepare(
                "SELECT target_id, relationship, via FROM codebase_edges
                 WHERE source_id = ?1 ORDER BY rowid",
            )
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Dependency {
                    target: row.get(0)?,
                    dep_type: row.get(1)?,
                    via: DependencyVia::from_str_lossy(&row.get::<_, String>(2)?),
                })
            })
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::metadata(e.to_string()))
    }

    fn find_with(conn: &Connection, id: &str) -> StoreResult<Option<ExtractedUnit>> {
        let row = conn
            .query_row(
                "SELECT id, unit_type, namespace, file_path, source_code, metadata, chunks
                 FROM codebase_units WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::metadata(e.to_string()))?;

        match row {
            Some((id, unit_type, namespace, file_path, source_code, metadata, chunks)) => {
                let deps = Self::dependencies_for(conn, &id)?;
                Self::row_to_unit(
                    id, unit_type, namespace, file_path, source_code, metadata, chunks, deps,
                )
                .map(Some)
            }
            None => Ok(None),
        }
    }

    fn edges_where(
        conn: &Connection,
        column: &str,
        id: &str,
        err: impl Fn(String) -> StoreError,
    ) -> StoreResult<Vec<GraphEdge>> {
        let sql = format!(
            "SELECT source_id, target_id, relationship, via FROM codebase_edges
             WHERE {column} = ?1 ORDER BY rowid"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| err(e.to_string()))?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(GraphEdge {
                    source: row.get(0)?,
                    target: row.get(1)?,
                    dep_type: row.get(2)?,
                    via: DependencyVia::from_str_lossy(&row.get::<_, String>(3)?),
                })
            })
            .map_err(|e| err(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| err(e.to_string()))
    }

    /// Load the full graph into the serializable form (used by pagerank
    /// and the `codebase://graph` resource).
    pub fn load_graph(&self) -> StoreResult<DependencyGraph> {
        let conn = self.conn.lock();
        let mut graph = DependencyGraph::new();

        {
            let mut stmt = conn
                .prepare("SELECT id, unit_type, namespace, file_path, source_code, metadata, chunks FROM codebase_units")
                .map_err(|e| StoreError::graph(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .map_err(|e| StoreError::graph(e.to_string()))?;

            for row in rows {
                let (id, unit_type, namespace, file_path, source_code, metadata, chunks) =
                    row.map_err(|e| StoreError::graph(e.to_string()))?;
                let deps = Self::dependencies_for(&conn, &id)?;
                let unit = Self::row_to_unit(
                    id, unit_type, namespace, file_path, source_code, metadata, chunks, deps,
                )?;
                graph.register(&unit);
            }
        }

        Ok(graph)
    }
}

// ---------------------------------------------------------------------------
// MetadataStore
// ---------------------------------------------------------------------------

impl MetadataStore for SqliteStore {
    fn store(&self, unit: &ExtractedUnit) -> StoreResult<()> {
        let metadata = serde_json::to_string(&unit.metadata)
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        let chunks = serde_json::to_string(&unit.chunks)
            .map_err(|e| StoreError::metadata(e.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO codebase_units (id, unit_type, namespace, file_path, source_code, metadata, chunks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 unit_type = excluded.unit_type,
                 namespace = excluded.namespace,
                 file_path = excluded.file_path,
                 source_code = excluded.source_code,
                 metadata = excluded.metadata,
                 chunks = excluded.chunks,
                 updated_at = datetime('now')",
            params![
                unit.identifier,
                unit.unit_type.as_str(),
                unit.namespace,
                unit.file_path,
                unit.source_code,
                metadata,
                chunks,
            ],
        )
        .map_err(|e| StoreError::metadata(e.to_string()))?;

        conn.execute(
            "DELETE FROM codebase_edges WHERE source_id = ?1",
            params![unit.identifier],
        )
        .map_err(|e| StoreError::metadata(e.to_string()))?;
        for dep in &unit.dependencies {
            conn.execute(
                "INSERT OR IGNORE INTO codebase_edges (source_id, target_id, relationship, via)
                 VALUES (?1, ?2, ?3, ?4)",
                params![unit.identifier, dep.target, dep.dep_type, dep.via.as_str()],
            )
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        }

        Ok(())
    }

    fn find(&self, id: &str) -> StoreResult<Option<ExtractedUnit>> {
        let conn = self.conn.lock();
        Self::find_with(&conn, id)
    }

    fn find_batch(&self, ids: &[String]) -> StoreResult<BTreeMap<String, ExtractedUnit>> {
        let conn = self.conn.lock();
        let mut out = BTreeMap::new();
        for id in ids {
            if let Some(unit) = Self::find_with(&conn, id)? {
                out.insert(id.clone(), unit);
            }
        }
        Ok(out)
    }

    fn find_by_type(&self, unit_type: UnitType) -> StoreResult<Vec<ExtractedUnit>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT id FROM codebase_units WHERE unit_type = ?1 ORDER BY id")
                .map_err(|e| StoreError::metadata(e.to_string()))?;
            let rows = stmt
                .query_map(params![unit_type.as_str()], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::metadata(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::metadata(e.to_string()))?
        };

        let mut units = Vec::with_capacity(ids.len());
        let conn = self.conn.lock();
        for id in ids {
            if let Some(unit) = Self::find_with(&conn, &id)? {
                units.push(unit);
            }
        }
        Ok(units)
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
        let pattern = format!("%{needle}%");

        let conn = self.conn.lock();
        let mut seen = std::collections::BTreeSet::new();
        let mut matches = Vec::new();

        for field in SearchField::ALL {
            if !fields.contains(&field) || matches.len() >= limit {
                continue;
            }
            let column = match field {
                SearchField::Identifier => "id",
                SearchField::FilePath => "file_path",
                SearchField::SourceCode => "COALESCE(source_code, '')",
                SearchField::MetadataJson => "metadata",
            };
            let sql = format!(
                "SELECT id FROM codebase_units WHERE LOWER({column}) LIKE ?1 ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::metadata(e.to_string()))?;
            let ids = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::metadata(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::metadata(e.to_string()))?;

            for id in ids {
                if matches.len() >= limit {
                    break;
                }
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(unit) = Self::find_with(&conn, &id)? {
                    matches.push(FieldMatch { unit, field });
                }
            }
        }

        Ok(matches)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM codebase_edges WHERE source_id = ?1", params![id])
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        let removed = conn
            .execute("DELETE FROM codebase_units WHERE id = ?1", params![id])
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        Ok(removed > 0)
    }

    fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM codebase_units", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| StoreError::metadata(e.to_string()))
    }

    fn all_identifiers(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM codebase_units ORDER BY id")
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::metadata(e.to_string()))
    }

    fn counts_by_type(&self) -> StoreResult<BTreeMap<UnitType, usize>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT unit_type, COUNT(*) FROM codebase_units GROUP BY unit_type")
            .map_err(|e| StoreError::metadata(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| StoreError::metadata(e.to_string()))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (type_str, count) = row.map_err(|e| StoreError::metadata(e.to_string()))?;
            if let Some(unit_type) = UnitType::parse(&type_str) {
                counts.insert(unit_type, count as usize);
            }
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// VectorStore
// ---------------------------------------------------------------------------

impl VectorStore for SqliteStore {
    fn store(&self, id: &str, vector: &[f32], metadata: &Metadata) -> StoreResult<()> {
        let blob = bincode::serialize(vector).map_err(|e| StoreError::vector(e.to_string()))?;
        let metadata_json =
            serde_json::to_string(metadata).map_err(|e| StoreError::vector(e.to_string()))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO codebase_embeddings (id, embedding, metadata)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 embedding = excluded.embedding,
                 metadata = excluded.metadata,
                 updated_at = datetime('now')",
            params![id, blob, metadata_json],
        )
        .map_err(|e| StoreError::vector(e.to_string()))?;
        Ok(())
    }

    fn search(&self, query: &[f32], limit: usize, filters: &Filters) -> StoreResult<Vec<VectorHit>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, embedding, metadata FROM codebase_embeddings")
            .map_err(|e| StoreError::vector(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| StoreError::vector(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, blob, metadata_json) = row.map_err(|e| StoreError::vector(e.to_string()))?;
            let metadata: Metadata = serde_json::from_str(&metadata_json)
                .map_err(|e| StoreError::vector(e.to_string()))?;
            if !matches_filters(&metadata, filters) {
                continue;
            }
            let vector: Vec<f32> =
                bincode::deserialize(&blob).map_err(|e| StoreError::vector(e.to_string()))?;
            hits.push(VectorHit { id, score: cosine_score(query, &vector), metadata });
        }

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
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM codebase_embeddings WHERE id = ?1", params![id])
            .map_err(|e| StoreError::vector(e.to_string()))?;
        Ok(removed > 0)
    }

    fn delete_by_filter(&self, filters: &Filters) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, metadata FROM codebase_embeddings")
            .map_err(|e| StoreError::vector(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::vector(e.to_string()))?;

        let mut doomed = Vec::new();
        for row in rows {
            let (id, metadata_json) = row.map_err(|e| StoreError::vector(e.to_string()))?;
            let metadata: Metadata = serde_json::from_str(&metadata_json)
                .map_err(|e| StoreError::vector(e.to_string()))?;
            if matches_filters(&metadata, filters) {
                doomed.push(id);
            }
        }
        drop(stmt);

        for id in &doomed {
            conn.execute("DELETE FROM codebase_embeddings WHERE id = ?1", params![id])
                .map_err(|e| StoreError::vector(e.to_string()))?;
        }
        Ok(doomed.len())
    }

    fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM codebase_embeddings", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| StoreError::vector(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

impl GraphStore for SqliteStore {
    fn register(&self, unit: &ExtractedUnit) -> StoreResult<()> {
        // Units and edges share tables with the metadata surface; a
        // register is an upsert of the same row plus its edges.
        MetadataStore::store(self, unit).map_err(|e| StoreError::graph(e.to_string()))
    }

    fn dependencies_of(&self, id: &str) -> StoreResult<Vec<GraphEdge>> {
        let conn = self.conn.lock();
        Self::edges_where(&conn, "source_id", id, |m| StoreError::Graph { message: m })
    }

    fn dependents_of(&self, id: &str) -> StoreResult<Vec<GraphEdge>> {
        let conn = self.conn.lock();
        Self::edges_where(&conn, "target_id", id, |m| StoreError::Graph { message: m })
    }

    fn by_type(&self, unit_type: UnitType) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id FROM codebase_units WHERE unit_type = ?1 ORDER BY id")
            .map_err(|e| StoreError::graph(e.to_string()))?;
        let rows = stmt
            .query_map(params![unit_type.as_str()], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::graph(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::graph(e.to_string()))
    }

    fn affected_by(&self, paths: &[String]) -> StoreResult<Vec<String>> {
        self.load_graph().map(|graph| graph.affected_by(paths))
    }

    fn pagerank(&self) -> StoreResult<BTreeMap<String, f64>> {
        self.load_graph().map(|graph| graph.pagerank())
    }

    fn unregister(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM codebase_edges WHERE source_id = ?1", params![id])
            .map_err(|e| StoreError::graph(e.to_string()))?;
        let removed = conn
            .execute("DELETE FROM codebase_units WHERE id = ?1", params![id])
            .map_err(|e| StoreError::graph(e.to_string()))?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_unit() -> ExtractedUnit {
        let mut unit = ExtractedUnit::new(UnitType::Model, "Comment", "app/models/comment.rb");
        unit.source_code = Some("class Comment < ApplicationRecord\nend".into());
        unit.metadata.insert("table_name".into(), json!("comments"));
        unit.dependencies.push(Dependency {
            target: "Post".into(),
            dep_type: "belongs_to".into(),
            via: DependencyVia::Association,
        });
        unit
    }

    #[test]
    fn test_migrations_apply_once() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert_eq!(store.schema_version().expect("version"), 2);
        // Re-running is a no-op.
        store.migrate().expect("re-migrate");
        assert_eq!(store.schema_version().expect("version"), 2);
    }

    #[test]
    fn test_unit_round_trip_rebuilds_dependencies() {
        let store = SqliteStore::open_in_memory().expect("open");
        let unit = sample_unit();
        MetadataStore::store(&store, &unit).expect("store");

        let loaded = store.find("Comment").expect("find").expect("present");
        assert_eq!(loaded.identifier, "Comment");
        assert_eq!(loaded.dependencies.len(), 1);
        assert_eq!(loaded.dependencies[0].target, "Post");
        assert_eq!(loaded.dependencies[0].via, DependencyVia::Association);
        assert_eq!(loaded.metadata.get("table_name"), Some(&json!("comments")));
    }

    #[test]
    fn test_upsert_replaces_edges() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut unit = sample_unit();
        MetadataStore::store(&store, &unit).expect("store");

        unit.dependencies.clear();
        MetadataStore::store(&store, &unit).expect("re-store");
        let loaded = store.find("Comment").expect("find").expect("present");
        assert!(loaded.dependencies.is_empty());
        assert_eq!(MetadataStore::count(&store).expect("count"), 1);
    }

    #[test]
    fn test_search_reports_matched_field() {
        let store = SqliteStore::open_in_memory().expect("open");
        MetadataStore::store(&store, &sample_unit()).expect("store");

        let matches = MetadataStore::search(&store, "comment", &SearchField::ALL, 10)
            .expect("search");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].field, SearchField::Identifier);

        let matches =
            MetadataStore::search(&store, "applicationrecord", &[SearchField::SourceCode], 10)
                .expect("search");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].field, SearchField::SourceCode);
    }

    #[test]
    fn test_vector_round_trip_and_filtered_delete() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut unit_meta = Metadata::new();
        unit_meta.insert("unit".into(), json!("Comment"));
        unit_meta.insert("granularity".into(), json!("chunk"));

        VectorStore::store(&store, "Comment::chunk#whole", &[0.6, 0.8], &unit_meta)
            .expect("store vector");
        assert_eq!(VectorStore::count(&store).expect("count"), 1);

        let hits = VectorStore::search(&store, &[0.6, 0.8], 5, &Filters::new()).expect("search");
        assert_eq!(hits[0].id, "Comment::chunk#whole");
        assert!(hits[0].score > 0.99);

        let mut filters = Filters::new();
        filters.insert("unit".into(), json!("Comment"));
        assert_eq!(store.delete_by_filter(&filters).expect("delete"), 1);
        assert_eq!(VectorStore::count(&store).expect("count"), 0);
    }

    #[test]
    fn test_graph_surface_over_edges() {
        let store = SqliteStore::open_in_memory().expect("open");
        GraphStore::register(&store, &sample_unit()).expect("register");
        GraphStore::register(
            &store,
            &ExtractedUnit::new(UnitType::Model, "Post", "app/models/post.rb"),
        )
        .expect("register");

        let deps = store.dependencies_of("Comment").expect("deps");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].target, "Post");

        let dependents = store.dependents_of("Post").expect("dependents");
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].source, "Comment");

        let affected = store
            .affected_by(&["app/models/post.rb".to_string()])
            .expect("affected");
        assert!(affected.contains(&"Post".to_string()));
        assert!(affected.contains(&"Comment".to_string()));
    }
}
