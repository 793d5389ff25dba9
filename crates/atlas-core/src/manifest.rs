//! Index and change manifests.
//!
//! The index manifest is the extraction snapshot header (counts, git
//! position, timestamps). The change manifest is the content-hash diff
//! between two extraction runs; the incremental indexer consumes it to
//! decide what to re-embed and what to delete.
//!
//! Both files are written atomically: serialize to a temp path in the
//! same directory, then rename. Readers tolerate a stale manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AtlasError, AtlasResult};
use crate::types::{DependencyVia, ExtractedUnit, UnitType};

/// File name of the index manifest under the index directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// File name of the change manifest under the index directory.
pub const CHANGE_MANIFEST_FILE: &str = "_change_manifest.json";
/// File name of the serialized dependency graph.
pub const GRAPH_FILE: &str = "dependency_graph.json";

// ---------------------------------------------------------------------------
// Index manifest
// ---------------------------------------------------------------------------

/// Snapshot header written by the extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Framework version of the extracted application, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rails_version: Option<String>,
    /// Language version of the extracted application.
    pub language_version: String,
    /// Extraction timestamp (UTC ISO-8601).
    pub extracted_at: String,
    /// Git commit the snapshot was taken at.
    pub git_sha: String,
    /// Git branch the snapshot was taken on.
    pub git_branch: String,
    /// Total units in the snapshot.
    pub total_units: usize,
    /// Unit counts by type tag.
    pub counts: BTreeMap<String, usize>,
}

impl IndexManifest {
    /// Load from `<index-dir>/manifest.json`.
    pub fn load(index_dir: &Path) -> AtlasResult<Option<Self>> {
        let path = index_dir.join(MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| AtlasError::Serialization(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically write to `<index-dir>/manifest.json`.
    pub fn write(&self, index_dir: &Path) -> AtlasResult<()> {
        write_json_atomic(&index_dir.join(MANIFEST_FILE), self)
    }

    /// Build from the current unit set plus git position.
    pub fn from_units(
        units: &[ExtractedUnit],
        git_sha: &str,
        git_branch: &str,
        language_version: &str,
        rails_version: Option<&str>,
    ) -> Self {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for unit in units {
            *counts.entry(unit.unit_type.as_str().to_string()).or_insert(0) += 1;
        }
        Self {
            rails_version: rails_version.map(str::to_string),
            language_version: language_version.to_string(),
            extracted_at: chrono::Utc::now().to_rfc3339(),
            git_sha: git_sha.to_string(),
            git_branch: git_branch.to_string(),
            total_units: units.len(),
            counts,
        }
    }

    /// The structural-overview line used as the assembler's structural
    /// section, e.g. `Codebase: 993 units (480 models, 120 controllers)`.
    pub fn structural_overview(&self) -> String {
        let mut parts: Vec<(usize, &str)> = self
            .counts
            .iter()
            .map(|(type_tag, count)| (*count, type_tag.as_str()))
            .collect();
        parts.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

        let listing: Vec<String> = parts
            .iter()
            .map(|(count, type_tag)| format!("{count} {type_tag}s"))
            .collect();

        if listing.is_empty() {
            format!("Codebase: {} units", self.total_units)
        } else {
            format!("Codebase: {} units ({})", self.total_units, listing.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// Change manifest
// ---------------------------------------------------------------------------

/// Per-class identifier lists of one diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Identifiers absent in the previous run.
    pub added: Vec<String>,
    /// Identifiers whose content hash changed (including transitive
    /// invalidations).
    pub modified: Vec<String>,
    /// Identifiers present previously, absent now.
    pub deleted: Vec<String>,
    /// Identifiers whose content hash is unchanged.
    pub unchanged: Vec<String>,
}

/// Summary counts of one diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Count of added units.
    pub added: usize,
    /// Count of modified units.
    pub modified: usize,
    /// Count of deleted units.
    pub deleted: usize,
    /// Count of unchanged units.
    pub unchanged: usize,
    /// Total current units.
    pub total: usize,
}

/// Content-hash diff between two extraction runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeManifest {
    /// Diff timestamp (UTC ISO-8601).
    pub generated_at: String,
    /// Git commit of the current run.
    pub git_sha: String,
    /// Git commit of the previous run, when one existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_git_sha: Option<String>,
    /// Summary counts.
    pub summary: ChangeSummary,
    /// Per-class identifier lists.
    pub changes: ChangeSet,
    /// Content hash per current identifier; the next run diffs against
    /// these.
    pub hashes: BTreeMap<String, String>,
}

impl ChangeManifest {
    /// Load from `<index-dir>/_change_manifest.json`.
    pub fn load(index_dir: &Path) -> AtlasResult<Option<Self>> {
        let path = index_dir.join(CHANGE_MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| AtlasError::Serialization(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically write to `<index-dir>/_change_manifest.json`.
    pub fn write(&self, index_dir: &Path) -> AtlasResult<()> {
        write_json_atomic(&index_dir.join(CHANGE_MANIFEST_FILE), self)
    }
}

/// SHA-256 over identifier ++ source ++ canonical metadata ++ sorted
/// dependency list. Metadata serializes from a BTreeMap, so key order
/// is already canonical.
pub fn content_hash(unit: &ExtractedUnit) -> String {
    let mut hasher = Sha256::new();
    hasher.update(unit.identifier.as_bytes());
    hasher.update([0]);
    hasher.update(unit.source_code.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_string(&unit.metadata).unwrap_or_default().as_bytes());
    hasher.update([0]);

    let mut deps: Vec<String> = unit
        .dependencies
        .iter()
        .map(|d| format!("{}|{}|{}", d.target, d.dep_type, d.via.as_str()))
        .collect();
    deps.sort();
    for dep in deps {
        hasher.update(dep.as_bytes());
        hasher.update([0]);
    }

    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Invalidator
// ---------------------------------------------------------------------------

/// Computes the change manifest for a new extraction run, including the
/// transitive invalidation rules.
pub struct Invalidator;

impl Invalidator {
    /// Diff the current unit set against the previous change manifest.
    ///
    /// Transitive rules widen `modified`:
    /// - a changed concern invalidates every unit that includes it
    ///   (concern bodies are inlined at extraction);
    /// - a changed unit carrying `metadata.tables` (a migration)
    ///   invalidates every model whose `metadata.table_name` is listed.
    pub fn diff(
        units: &[ExtractedUnit],
        previous: Option<&ChangeManifest>,
        git_sha: &str,
    ) -> ChangeManifest {
        let previous_hashes: &BTreeMap<String, String> = match previous {
            Some(manifest) => &manifest.hashes,
            None => &EMPTY_HASHES,
        };

        let mut hashes = BTreeMap::new();
        let mut added = Vec::new();
        let mut modified = BTreeSet::new();
        let mut unchanged = Vec::new();

        for unit in units {
            let hash = content_hash(unit);
            match previous_hashes.get(&unit.identifier) {
                None => added.push(unit.identifier.clone()),
                Some(previous_hash) if *previous_hash != hash => {
                    modified.insert(unit.identifier.clone());
                }
                Some(_) => unchanged.push(unit.identifier.clone()),
            }
            hashes.insert(unit.identifier.clone(), hash);
        }

        let current_ids: BTreeSet<&String> = hashes.keys().collect();
        let deleted: Vec<String> = previous_hashes
            .keys()
            .filter(|id| !current_ids.contains(id))
            .cloned()
            .collect();

        // Transitive invalidation, applied until no new units move.
        // Directly-changed units seed the cascade.
        let mut dirty: Vec<String> =
            added.iter().chain(modified.iter()).cloned().collect();
        while let Some(changed_id) = dirty.pop() {
            let Some(changed) = units.iter().find(|u| u.identifier == changed_id) else {
                continue;
            };

            let mut newly_dirty: Vec<String> = Vec::new();

            if changed.unit_type == UnitType::Concern {
                for unit in units {
                    let includes_changed = unit.dependencies.iter().any(|d| {
                        d.target == changed_id
                            && matches!(d.via, DependencyVia::Include | DependencyVia::Extend)
                    });
                    if includes_changed {
                        newly_dirty.push(unit.identifier.clone());
                    }
                }
            }

            if let Some(tables) = changed.metadata.get("tables").and_then(|v| v.as_array()) {
                let tables: BTreeSet<&str> =
                    tables.iter().filter_map(|t| t.as_str()).collect();
                for unit in units {
                    if unit.unit_type != UnitType::Model {
                        continue;
                    }
                    let on_affected_table = unit
                        .metadata
                        .get("table_name")
                        .and_then(|v| v.as_str())
                        .is_some_and(|t| tables.contains(t));
                    if on_affected_table {
                        newly_dirty.push(unit.identifier.clone());
                    }
                }
            }

            for id in newly_dirty {
                let was_unchanged = unchanged.iter().position(|u| *u == id);
                if let Some(pos) = was_unchanged {
                    unchanged.remove(pos);
                    modified.insert(id.clone());
                    dirty.push(id);
                }
            }
        }

        let modified: Vec<String> = modified.into_iter().collect();
        let summary = ChangeSummary {
            added: added.len(),
            modified: modified.len(),
            deleted: deleted.len(),
            unchanged: unchanged.len(),
            total: units.len(),
        };

        ChangeManifest {
            generated_at: chrono::Utc::now().to_rfc3339(),
            git_sha: git_sha.to_string(),
            previous_git_sha: previous.map(|m| m.git_sha.clone()),
            summary,
            changes: ChangeSet { added, modified, deleted, unchanged },
            hashes,
        }
    }
}

static EMPTY_HASHES: BTreeMap<String, String> = BTreeMap::new();

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Serialize to a temp file in the target directory, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AtlasResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp: PathBuf = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| AtlasError::Serialization(e.to_string()))?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dependency;
    use serde_json::json;

    fn unit(id: &str, unit_type: UnitType, source: &str) -> ExtractedUnit {
        let mut u = ExtractedUnit::new(unit_type, id, format!("app/{}.rb", id.to_lowercase()));
        u.source_code = Some(source.to_string());
        u
    }

    #[test]
    fn test_content_hash_sensitive_to_parts() {
        let base = unit("User", UnitType::Model, "class User\nend");
        let h1 = content_hash(&base);

        let mut changed_source = base.clone();
        changed_source.source_code = Some("class User\n  # changed\nend".into());
        assert_ne!(h1, content_hash(&changed_source));

        let mut changed_meta = base.clone();
        changed_meta.metadata.insert("importance".into(), json!("high"));
        assert_ne!(h1, content_hash(&changed_meta));

        let mut changed_deps = base.clone();
        changed_deps.dependencies.push(Dependency {
            target: "Post".into(),
            dep_type: "has_many".into(),
            via: DependencyVia::Association,
        });
        assert_ne!(h1, content_hash(&changed_deps));
    }

    #[test]
    fn test_content_hash_dependency_order_insensitive() {
        let mut a = unit("User", UnitType::Model, "x");
        a.dependencies = vec![
            Dependency { target: "A".into(), dep_type: "t".into(), via: DependencyVia::Reference },
            Dependency { target: "B".into(), dep_type: "t".into(), via: DependencyVia::Reference },
        ];
        let mut b = a.clone();
        b.dependencies.reverse();
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_diff_partitions_are_disjoint_and_complete() {
        let first = vec![
            unit("User", UnitType::Model, "v1"),
            unit("Post", UnitType::Model, "v1"),
            unit("Gone", UnitType::Service, "v1"),
        ];
        let manifest1 = Invalidator::diff(&first, None, "sha1");
        assert_eq!(manifest1.summary.added, 3);

        let second = vec![
            unit("User", UnitType::Model, "v2"), // modified
            unit("Post", UnitType::Model, "v1"), // unchanged
            unit("Fresh", UnitType::Job, "v1"),  // added
        ];
        let manifest2 = Invalidator::diff(&second, Some(&manifest1), "sha2");

        assert_eq!(manifest2.changes.added, vec!["Fresh"]);
        assert_eq!(manifest2.changes.modified, vec!["User"]);
        assert_eq!(manifest2.changes.deleted, vec!["Gone"]);
        assert_eq!(manifest2.changes.unchanged, vec!["Post"]);
        assert_eq!(manifest2.previous_git_sha.as_deref(), Some("sha1"));

        // Disjoint partition whose union is current ∪ deleted.
        let mut all: Vec<&String> = manifest2
            .changes
            .added
            .iter()
            .chain(&manifest2.changes.modified)
            .chain(&manifest2.changes.deleted)
            .chain(&manifest2.changes.unchanged)
            .collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(before, all.len());
        assert_eq!(before, second.len() + 1);
        assert_eq!(manifest2.summary.total, second.len());
    }

    #[test]
    fn test_changed_concern_invalidates_includers() {
        let mut concern = unit("Trackable", UnitType::Concern, "module Trackable v1");
        let mut includer = unit("User", UnitType::Model, "class User");
        includer.dependencies.push(Dependency {
            target: "Trackable".into(),
            dep_type: "includes".into(),
            via: DependencyVia::Include,
        });
        let bystander = unit("Post", UnitType::Model, "class Post");

        let first = vec![concern.clone(), includer.clone(), bystander.clone()];
        let manifest1 = Invalidator::diff(&first, None, "sha1");

        concern.source_code = Some("module Trackable v2".into());
        let second = vec![concern, includer, bystander];
        let manifest2 = Invalidator::diff(&second, Some(&manifest1), "sha2");

        assert!(manifest2.changes.modified.contains(&"Trackable".to_string()));
        assert!(
            manifest2.changes.modified.contains(&"User".to_string()),
            "includer must be invalidated"
        );
        assert!(manifest2.changes.unchanged.contains(&"Post".to_string()));
    }

    #[test]
    fn test_changed_migration_invalidates_models_on_tables() {
        let mut migration = unit("AddAgeToUsers", UnitType::RailsSource, "migration v1");
        migration.metadata.insert("tables".into(), json!(["users"]));

        let mut user = unit("User", UnitType::Model, "class User");
        user.metadata.insert("table_name".into(), json!("users"));
        let mut post = unit("Post", UnitType::Model, "class Post");
        post.metadata.insert("table_name".into(), json!("posts"));

        let first = vec![migration.clone(), user.clone(), post.clone()];
        let manifest1 = Invalidator::diff(&first, None, "sha1");

        migration.source_code = Some("migration v2".into());
        let second = vec![migration, user, post];
        let manifest2 = Invalidator::diff(&second, Some(&manifest1), "sha2");

        assert!(manifest2.changes.modified.contains(&"User".to_string()));
        assert!(manifest2.changes.unchanged.contains(&"Post".to_string()));
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let units = vec![unit("User", UnitType::Model, "v1")];
        let manifest = IndexManifest::from_units(&units, "abc123", "main", "ruby 3.3.0", Some("7.1.3"));
        manifest.write(dir.path()).expect("write");

        let loaded = IndexManifest::load(dir.path()).expect("load").expect("present");
        assert_eq!(manifest, loaded);
        assert!(!dir.path().join("manifest.json.tmp").exists(), "temp file renamed away");
    }

    #[test]
    fn test_change_manifest_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let manifest = Invalidator::diff(&[unit("User", UnitType::Model, "v1")], None, "sha1");
        manifest.write(dir.path()).expect("write");
        let loaded = ChangeManifest::load(dir.path()).expect("load").expect("present");
        assert_eq!(manifest, loaded);
    }

    #[test]
    fn test_missing_manifest_loads_none() {
        let dir = tempfile::tempdir().expect("create temp dir");
        assert!(IndexManifest::load(dir.path()).expect("load").is_none());
        assert!(ChangeManifest::load(dir.path()).expect("load").is_none());
    }

    #[test]
    fn test_structural_overview_format() {
        let mut counts = BTreeMap::new();
        counts.insert("model".to_string(), 3);
        counts.insert("controller".to_string(), 2);
        counts.insert("job".to_string(), 1);
        let manifest = IndexManifest {
            total_units: 6,
            counts,
            ..IndexManifest::default()
        };
        assert_eq!(
            manifest.structural_overview(),
            "Codebase: 6 units (3 models, 2 controllers, 1 jobs)"
        );
    }
}
