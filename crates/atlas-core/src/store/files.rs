//! Per-unit JSON files under the index directory.
//!
//! Extraction (an external pass) writes one JSON file per unit at
//! `<index-dir>/<type>s/<sanitized-identifier>_<8-hex-digest>.json`.
//! This module reads and writes that layout, and seeds the in-memory
//! stores from it. It is also the file fallback of the degradation
//! ladder: when every database backend is down, units can still be
//! served from disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{AtlasError, AtlasResult};
use crate::store::{GraphStore, MetadataStore};
use crate::types::{ExtractedUnit, UnitType};

/// Replace `::` with `__`, then any character outside `[A-Za-z0-9_-]`
/// with `_`. The digest suffix keeps distinct identifiers collision-free
/// even after lossy sanitization.
pub fn sanitize_identifier(identifier: &str) -> String {
    let replaced = identifier.replace("::", "__");
    replaced
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// First 8 hex characters of the SHA-256 of the original identifier.
pub fn identifier_digest(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

/// File name for a unit: `<sanitized>_<8hex>.json`.
pub fn unit_file_name(identifier: &str) -> String {
    format!("{}_{}.json", sanitize_identifier(identifier), identifier_digest(identifier))
}

/// Reader/writer for the per-unit JSON layout.
pub struct FileUnitStore {
    index_dir: PathBuf,
}

impl FileUnitStore {
    /// A store rooted at the given index directory.
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self { index_dir: index_dir.into() }
    }

    /// The index directory root.
    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Path a unit's JSON file lives at.
    pub fn unit_path(&self, unit_type: UnitType, identifier: &str) -> PathBuf {
        self.index_dir
            .join(unit_type.dir_name())
            .join(unit_file_name(identifier))
    }

    /// Write one unit, creating the type directory if needed.
    pub fn write_unit(&self, unit: &ExtractedUnit) -> AtlasResult<()> {
        let path = self.unit_path(unit.unit_type, &unit.identifier);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(unit)
            .map_err(|e| AtlasError::Serialization(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    /// Remove one unit's file. Returns whether it existed.
    pub fn delete_unit(&self, unit_type: UnitType, identifier: &str) -> AtlasResult<bool> {
        let path = self.unit_path(unit_type, identifier);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every unit file under every `<type>s/` directory.
    ///
    /// Unreadable or unparsable files are logged and skipped; a corrupt
    /// unit should not take down the whole load.
    pub fn load_units(&self) -> AtlasResult<Vec<ExtractedUnit>> {
        let mut units = Vec::new();

        for unit_type in UnitType::ALL {
            let dir = self.index_dir.join(unit_type.dir_name());
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(AtlasError::from)
                    .and_then(|text| {
                        serde_json::from_str::<ExtractedUnit>(&text)
                            .map_err(|e| AtlasError::Serialization(e.to_string()))
                    }) {
                    Ok(unit) => units.push(unit),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable unit file");
                    }
                }
            }
        }

        units.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(units)
    }

    /// Load all units and register them into the given stores.
    /// Returns the number of units seeded.
    pub fn seed(
        &self,
        metadata: &dyn MetadataStore,
        graph: &dyn GraphStore,
    ) -> AtlasResult<usize> {
        let units = self.load_units()?;
        for unit in &units {
            metadata.store(unit)?;
            graph.register(unit)?;
        }
        tracing::info!(units = units.len(), dir = %self.index_dir.display(), "seeded stores from unit files");
        Ok(units.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryGraphStore, InMemoryMetadataStore};

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("PostsController"), "PostsController");
        assert_eq!(sanitize_identifier("Admin::UsersController"), "Admin__UsersController");
        assert_eq!(sanitize_identifier("User#full_name"), "User_full_name");
        assert_eq!(sanitize_identifier("weird name!"), "weird_name_");
    }

    #[test]
    fn test_digest_disambiguates_sanitization_collisions() {
        // Both sanitize to "User_name" but keep distinct digests.
        let a = unit_file_name("User#name");
        let b = unit_file_name("User.name");
        assert_ne!(a, b);
        assert!(a.ends_with(".json"));
        let digest = identifier_digest("User#name");
        assert_eq!(digest.len(), 8);
        assert!(a.contains(&digest));
    }

    #[test]
    fn test_write_load_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = FileUnitStore::new(dir.path());

        let mut unit = ExtractedUnit::new(UnitType::Model, "Admin::User", "app/models/admin/user.rb");
        unit.source_code = Some("class User < ApplicationRecord\nend".into());
        store.write_unit(&unit).expect("write");

        let expected = dir.path().join("models").join(unit_file_name("Admin::User"));
        assert!(expected.exists());

        let loaded = store.load_units().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identifier, "Admin::User");
        assert_eq!(loaded[0].source_code, unit.source_code);
    }

    #[test]
    fn test_load_skips_corrupt_files() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = FileUnitStore::new(dir.path());

        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).expect("mkdir");
        std::fs::write(models.join("broken_deadbeef.json"), "{not json").expect("write");

        store
            .write_unit(&ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb"))
            .expect("write");

        let loaded = store.load_units().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].identifier, "User");
    }

    #[test]
    fn test_seed_registers_metadata_and_graph() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let files = FileUnitStore::new(dir.path());
        files
            .write_unit(&ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb"))
            .expect("write");

        let metadata = InMemoryMetadataStore::new();
        let graph = InMemoryGraphStore::new();
        let seeded = files.seed(&metadata, &graph).expect("seed");

        assert_eq!(seeded, 1);
        assert!(metadata.find("User").expect("find").is_some());
        assert_eq!(graph.by_type(UnitType::Model).expect("by_type"), vec!["User".to_string()]);
    }

    #[test]
    fn test_delete_unit() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = FileUnitStore::new(dir.path());
        let unit = ExtractedUnit::new(UnitType::Job, "NotificationJob", "app/jobs/notification_job.rb");
        store.write_unit(&unit).expect("write");

        assert!(store.delete_unit(UnitType::Job, "NotificationJob").expect("delete"));
        assert!(!store.delete_unit(UnitType::Job, "NotificationJob").expect("re-delete"));
    }
}
