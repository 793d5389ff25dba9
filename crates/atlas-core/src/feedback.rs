//! Retrieval feedback log and gap mining.
//!
//! An append-only JSON-lines file holds two record kinds: ratings
//! (1-5 with an optional comment) and gaps (a unit the caller expected
//! but retrieval missed). The gap detector scans the whole log for
//! recurring issues worth an operator's attention.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::classifier::QueryClassifier;
use crate::error::{AtlasError, AtlasResult};

/// One appended feedback record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackRecord {
    /// A 1-5 rating of one retrieval.
    Rating {
        /// The rated query.
        query: String,
        /// Score, 1 (useless) to 5 (perfect).
        score: u8,
        /// Optional free-form comment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        /// Record timestamp (UTC ISO-8601).
        timestamp: String,
    },
    /// A unit the caller expected in the results but did not get.
    Gap {
        /// The query that missed.
        query: String,
        /// Identifier of the missing unit.
        missing_unit: String,
        /// Type tag of the missing unit.
        unit_type: String,
        /// Record timestamp (UTC ISO-8601).
        timestamp: String,
    },
}

/// Append-only JSON-lines feedback log.
pub struct FeedbackStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FeedbackStore {
    /// A store appending to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    /// Append a rating. Scores outside 1..=5 are rejected.
    pub fn rate(&self, query: &str, score: u8, comment: Option<&str>) -> AtlasResult<()> {
        if !(1..=5).contains(&score) {
            return Err(AtlasError::validation(format!(
                "score must be between 1 and 5, got {score}"
            )));
        }
        self.append(&FeedbackRecord::Rating {
            query: query.to_string(),
            score,
            comment: comment.map(str::to_string),
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Append a gap report.
    pub fn report_gap(&self, query: &str, missing_unit: &str, unit_type: &str) -> AtlasResult<()> {
        self.append(&FeedbackRecord::Gap {
            query: query.to_string(),
            missing_unit: missing_unit.to_string(),
            unit_type: unit_type.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// All rating records.
    pub fn ratings(&self) -> AtlasResult<Vec<FeedbackRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| matches!(r, FeedbackRecord::Rating { .. }))
            .collect())
    }

    /// All gap records.
    pub fn gaps(&self) -> AtlasResult<Vec<FeedbackRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| matches!(r, FeedbackRecord::Gap { .. }))
            .collect())
    }

    /// Mean rating score, when any rating exists.
    pub fn average_score(&self) -> AtlasResult<Option<f64>> {
        let scores: Vec<f64> = self
            .read_all()?
            .iter()
            .filter_map(|r| match r {
                FeedbackRecord::Rating { score, .. } => Some(f64::from(*score)),
                FeedbackRecord::Gap { .. } => None,
            })
            .collect();
        if scores.is_empty() {
            return Ok(None);
        }
        Ok(Some(scores.iter().sum::<f64>() / scores.len() as f64))
    }

    /// Every record in append order. A missing file is an empty log;
    /// corrupt lines are skipped.
    pub fn read_all(&self) -> AtlasResult<Vec<FeedbackRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping corrupt feedback line");
                    None
                }
            })
            .collect())
    }

    fn append(&self, record: &FeedbackRecord) -> AtlasResult<()> {
        let json =
            serde_json::to_string(record).map_err(|e| AtlasError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gap detection
// ---------------------------------------------------------------------------

/// Minimum low-score queries sharing a keyword before it is an issue.
const DEFAULT_MIN_LOW_SCORE_QUERIES: usize = 3;
/// Minimum reports of the same missing unit before it is an issue.
const DEFAULT_MIN_MISSING_REPORTS: usize = 2;
/// A rating at or below this counts as low.
const LOW_SCORE_CEILING: u8 = 2;
/// How many sample queries ride along with each issue.
const SAMPLE_LIMIT: usize = 3;

/// One recurring issue mined from the feedback log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackIssue {
    /// Issue kind: `repeated_low_scores` or `frequently_missing`.
    pub kind: String,
    /// The shared keyword or missing unit name.
    pub subject: String,
    /// How many records back the issue.
    pub count: usize,
    /// Representative queries.
    pub samples: Vec<String>,
}

/// Scans the feedback log for recurring retrieval problems.
pub struct GapDetector {
    min_low_score_queries: usize,
    min_missing_reports: usize,
}

impl GapDetector {
    /// A detector with the default thresholds.
    pub fn new() -> Self {
        Self {
            min_low_score_queries: DEFAULT_MIN_LOW_SCORE_QUERIES,
            min_missing_reports: DEFAULT_MIN_MISSING_REPORTS,
        }
    }

    /// Override thresholds (tests, tuning).
    pub fn with_thresholds(min_low_score_queries: usize, min_missing_reports: usize) -> Self {
        Self {
            min_low_score_queries: min_low_score_queries.max(1),
            min_missing_reports: min_missing_reports.max(1),
        }
    }

    /// Mine the log for issues.
    pub fn detect(&self, store: &FeedbackStore) -> AtlasResult<Vec<FeedbackIssue>> {
        let records = store.read_all()?;
        let mut issues = Vec::new();

        // Keyword -> queries that rated poorly and contain it.
        let mut low_by_keyword: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in &records {
            let FeedbackRecord::Rating { query, score, .. } = record else { continue };
            if *score > LOW_SCORE_CEILING {
                continue;
            }
            for keyword in QueryClassifier::classify(query).keywords {
                let queries = low_by_keyword.entry(keyword).or_default();
                if !queries.contains(query) {
                    queries.push(query.clone());
                }
            }
        }
        for (keyword, queries) in low_by_keyword {
            if queries.len() >= self.min_low_score_queries {
                issues.push(FeedbackIssue {
                    kind: "repeated_low_scores".into(),
                    subject: keyword,
                    count: queries.len(),
                    samples: queries.into_iter().take(SAMPLE_LIMIT).collect(),
                });
            }
        }

        // Missing unit -> reporting queries.
        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in &records {
            let FeedbackRecord::Gap { query, missing_unit, .. } = record else { continue };
            missing.entry(missing_unit.clone()).or_default().push(query.clone());
        }
        for (unit, queries) in missing {
            if queries.len() >= self.min_missing_reports {
                issues.push(FeedbackIssue {
                    kind: "frequently_missing".into(),
                    subject: unit,
                    count: queries.len(),
                    samples: queries.into_iter().take(SAMPLE_LIMIT).collect(),
                });
            }
        }

        Ok(issues)
    }
}

impl Default for GapDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FeedbackStore) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = FeedbackStore::new(dir.path().join("feedback").join("log.jsonl"));
        (dir, store)
    }

    #[test]
    fn test_rate_and_average() {
        let (_dir, store) = store();
        store.rate("how do users sign up", 4, None).expect("rate");
        store.rate("billing flow", 2, Some("missed the service")).expect("rate");

        assert_eq!(store.ratings().expect("ratings").len(), 2);
        let avg = store.average_score().expect("avg").expect("present");
        assert!((avg - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounds_validated() {
        let (_dir, store) = store();
        assert!(store.rate("q", 0, None).is_err());
        assert!(store.rate("q", 6, None).is_err());
        assert!(store.rate("q", 1, None).is_ok());
        assert!(store.rate("q", 5, None).is_ok());
    }

    #[test]
    fn test_gaps_separate_from_ratings() {
        let (_dir, store) = store();
        store.rate("query", 5, None).expect("rate");
        store.report_gap("billing question", "InvoiceService", "service").expect("gap");

        assert_eq!(store.ratings().expect("ratings").len(), 1);
        let gaps = store.gaps().expect("gaps");
        assert_eq!(gaps.len(), 1);
        match &gaps[0] {
            FeedbackRecord::Gap { missing_unit, unit_type, .. } => {
                assert_eq!(missing_unit, "InvoiceService");
                assert_eq!(unit_type, "service");
            }
            FeedbackRecord::Rating { .. } => panic!("expected gap"),
        }
    }

    #[test]
    fn test_empty_log() {
        let (_dir, store) = store();
        assert!(store.read_all().expect("read").is_empty());
        assert!(store.average_score().expect("avg").is_none());
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("log.jsonl");
        std::fs::write(
            &path,
            "{\"kind\":\"rating\",\"query\":\"q\",\"score\":5,\"timestamp\":\"t\"}\nnot json\n",
        )
        .expect("write");
        let store = FeedbackStore::new(&path);
        assert_eq!(store.read_all().expect("read").len(), 1);
    }

    #[test]
    fn test_detector_repeated_low_scores() {
        let (_dir, store) = store();
        store.rate("billing invoices broken", 1, None).expect("rate");
        store.rate("billing summary wrong", 2, None).expect("rate");
        store.rate("billing export empty", 2, None).expect("rate");
        store.rate("users sign up", 5, None).expect("rate");

        let issues = GapDetector::with_thresholds(3, 2).detect(&store).expect("detect");
        let billing = issues
            .iter()
            .find(|i| i.kind == "repeated_low_scores" && i.subject == "billing")
            .expect("billing issue");
        assert_eq!(billing.count, 3);
        assert!(!billing.samples.is_empty());
    }

    #[test]
    fn test_detector_frequently_missing() {
        let (_dir, store) = store();
        store.report_gap("q1", "InvoiceService", "service").expect("gap");
        store.report_gap("q2", "InvoiceService", "service").expect("gap");
        store.report_gap("q3", "Other", "model").expect("gap");

        let issues = GapDetector::with_thresholds(3, 2).detect(&store).expect("detect");
        let missing = issues
            .iter()
            .find(|i| i.kind == "frequently_missing")
            .expect("missing issue");
        assert_eq!(missing.subject, "InvoiceService");
        assert_eq!(missing.count, 2);
    }

    #[test]
    fn test_high_scores_do_not_flag() {
        let (_dir, store) = store();
        for _ in 0..5 {
            store.rate("billing invoices", 5, None).expect("rate");
        }
        let issues = GapDetector::with_thresholds(3, 2).detect(&store).expect("detect");
        assert!(issues.iter().all(|i| i.kind != "repeated_low_scores"));
    }
}
