//! Write-side pipeline rate limiting and status snapshots.
//!
//! The guard tracks last-run timestamps per operation kind in a small
//! JSON file next to the index. Operator tools ask `allows` before
//! spawning work and `record` when they do; two extract requests inside
//! the cooldown window mean the second is refused, which is the only
//! multi-writer coordination the pipeline needs besides atomic renames.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, AtlasResult};
use crate::manifest::{write_json_atomic, IndexManifest};
use crate::store::{MetadataStore, VectorStore};

/// Default cooldown between runs of the same operation.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// File name of the guard state under the index directory.
pub const GUARD_FILE: &str = "_pipeline_guard.json";

/// Write-side operations the guard rate-limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationKind {
    /// Source extraction / manifest refresh.
    Extraction,
    /// Embedding indexer run.
    Embedding,
}

impl OperationKind {
    /// The key this operation uses in the guard state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GuardState {
    /// Operation kind -> unix epoch seconds of the last run.
    #[serde(default)]
    last_run: BTreeMap<String, u64>,
}

/// Cooldown-based rate limiter for pipeline write actions.
pub struct PipelineGuard {
    path: PathBuf,
    cooldown: Duration,
}

impl PipelineGuard {
    /// A guard persisting state under the given index directory.
    pub fn new(index_dir: &Path, cooldown: Duration) -> Self {
        Self { path: index_dir.join(GUARD_FILE), cooldown }
    }

    /// A guard with the default 60s cooldown.
    pub fn with_defaults(index_dir: &Path) -> Self {
        Self::new(index_dir, DEFAULT_COOLDOWN)
    }

    /// The configured cooldown.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Epoch seconds of the last recorded run, if any.
    pub fn last_run(&self, kind: OperationKind) -> AtlasResult<Option<u64>> {
        Ok(self.load()?.last_run.get(kind.as_str()).copied())
    }

    /// True when the cooldown for `kind` has elapsed (or it never ran).
    pub fn allows(&self, kind: OperationKind) -> AtlasResult<bool> {
        match self.last_run(kind)? {
            None => Ok(true),
            Some(last) => Ok(now_epoch().saturating_sub(last) >= self.cooldown.as_secs()),
        }
    }

    /// Like [`Self::allows`] but returns the rate-limited error directly.
    pub fn check(&self, kind: OperationKind) -> AtlasResult<()> {
        match self.last_run(kind)? {
            None => Ok(()),
            Some(last) => {
                let elapsed = now_epoch().saturating_sub(last);
                if elapsed >= self.cooldown.as_secs() {
                    Ok(())
                } else {
                    Err(AtlasError::RateLimited {
                        operation: kind.to_string(),
                        elapsed_secs: elapsed,
                        cooldown_secs: self.cooldown.as_secs(),
                    })
                }
            }
        }
    }

    /// Record that `kind` is running now.
    pub fn record(&self, kind: OperationKind) -> AtlasResult<()> {
        let mut state = self.load()?;
        state.last_run.insert(kind.as_str().to_string(), now_epoch());
        write_json_atomic(&self.path, &state)?;
        tracing::debug!(operation = %kind, "pipeline guard recorded run");
        Ok(())
    }

    fn load(&self) -> AtlasResult<GuardState> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| AtlasError::Serialization(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GuardState::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Status reporting
// ---------------------------------------------------------------------------

/// Snapshot of pipeline health for the `pipeline_status` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Overall status: `ok`, `no_index`, or `degraded`.
    pub status: String,
    /// Extraction timestamp from the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<String>,
    /// Total units recorded in the metadata store.
    pub total_units: usize,
    /// Unit counts by type tag.
    pub counts_by_type: BTreeMap<String, usize>,
    /// Git commit of the snapshot, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    /// Git branch of the snapshot, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    /// Seconds since extraction, when the manifest timestamp parses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness_seconds: Option<u64>,
    /// Vector count from the vector store health ping.
    pub vectors: usize,
}

/// Builds [`PipelineStatus`] snapshots from the manifest and store pings.
pub struct StatusReporter {
    index_dir: PathBuf,
    metadata: Arc<dyn MetadataStore>,
    vector: Arc<dyn VectorStore>,
}

impl StatusReporter {
    /// A reporter over the index dir and shared store handles.
    pub fn new(
        index_dir: impl Into<PathBuf>,
        metadata: Arc<dyn MetadataStore>,
        vector: Arc<dyn VectorStore>,
    ) -> Self {
        Self { index_dir: index_dir.into(), metadata, vector }
    }

    /// Assemble a status snapshot. Store failures degrade the status
    /// instead of erroring.
    pub fn report(&self) -> PipelineStatus {
        let manifest = IndexManifest::load(&self.index_dir).ok().flatten();

        let (total_units, counts_by_type, metadata_ok) = match (
            self.metadata.count(),
            self.metadata.counts_by_type(),
        ) {
            (Ok(total), Ok(counts)) => (
                total,
                counts
                    .into_iter()
                    .map(|(t, n)| (t.as_str().to_string(), n))
                    .collect(),
                true,
            ),
            _ => (0, BTreeMap::new(), false),
        };

        let (vectors, vector_ok) = match self.vector.count() {
            Ok(n) => (n, true),
            Err(_) => (0, false),
        };

        let status = if !metadata_ok || !vector_ok {
            "degraded"
        } else if manifest.is_none() {
            "no_index"
        } else {
            "ok"
        };

        let staleness_seconds = manifest.as_ref().and_then(|m| {
            chrono::DateTime::parse_from_rfc3339(&m.extracted_at)
                .ok()
                .map(|at| {
                    let elapsed = chrono::Utc::now().signed_duration_since(at);
                    elapsed.num_seconds().max(0) as u64
                })
        });

        PipelineStatus {
            status: status.to_string(),
            extracted_at: manifest.as_ref().map(|m| m.extracted_at.clone()),
            total_units,
            counts_by_type,
            git_sha: manifest.as_ref().map(|m| m.git_sha.clone()),
            git_branch: manifest.as_ref().map(|m| m.git_branch.clone()),
            staleness_seconds,
            vectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryMetadataStore, InMemoryVectorStore};
    use crate::types::{ExtractedUnit, UnitType};

    #[test]
    fn test_guard_allows_first_run() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let guard = PipelineGuard::with_defaults(dir.path());
        assert!(guard.allows(OperationKind::Extraction).expect("allows"));
        assert!(guard.check(OperationKind::Extraction).is_ok());
    }

    #[test]
    fn test_guard_refuses_inside_cooldown() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let guard = PipelineGuard::new(dir.path(), Duration::from_secs(60));

        guard.record(OperationKind::Extraction).expect("record");
        assert!(!guard.allows(OperationKind::Extraction).expect("allows"));

        let err = guard.check(OperationKind::Extraction).expect_err("rate limited");
        assert_eq!(err.kind(), crate::error::ErrorKind::RateLimited);
    }

    #[test]
    fn test_guard_kinds_are_independent() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let guard = PipelineGuard::new(dir.path(), Duration::from_secs(60));

        guard.record(OperationKind::Extraction).expect("record");
        assert!(guard.allows(OperationKind::Embedding).expect("allows"));
    }

    #[test]
    fn test_guard_zero_cooldown_always_allows() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let guard = PipelineGuard::new(dir.path(), Duration::from_secs(0));
        guard.record(OperationKind::Embedding).expect("record");
        assert!(guard.allows(OperationKind::Embedding).expect("allows"));
    }

    #[test]
    fn test_guard_state_survives_reload() {
        let dir = tempfile::tempdir().expect("create temp dir");
        {
            let guard = PipelineGuard::new(dir.path(), Duration::from_secs(60));
            guard.record(OperationKind::Extraction).expect("record");
        }
        let guard = PipelineGuard::new(dir.path(), Duration::from_secs(60));
        assert!(!guard.allows(OperationKind::Extraction).expect("allows"));
    }

    #[test]
    fn test_status_no_index() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let reporter = StatusReporter::new(
            dir.path(),
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryVectorStore::new()),
        );
        let status = reporter.report();
        assert_eq!(status.status, "no_index");
        assert_eq!(status.total_units, 0);
    }

    #[test]
    fn test_status_ok_with_manifest() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata
            .store(&ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb"))
            .expect("store");

        let units = vec![ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb")];
        IndexManifest::from_units(&units, "abc123", "main", "ruby 3.3.0", None)
            .write(dir.path())
            .expect("write");

        let reporter =
            StatusReporter::new(dir.path(), metadata, Arc::new(InMemoryVectorStore::new()));
        let status = reporter.report();
        assert_eq!(status.status, "ok");
        assert_eq!(status.total_units, 1);
        assert_eq!(status.git_sha.as_deref(), Some("abc123"));
        assert_eq!(status.counts_by_type.get("model"), Some(&1));
        assert!(status.staleness_seconds.is_some());
    }
}
