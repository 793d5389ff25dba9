//! Rank fusion and weighted re-scoring.
//!
//! Stage 1 merges multi-source candidate lists with Reciprocal Rank
//! Fusion (K = 60). Stage 2 scores six signals per survivor. Stage 3
//! applies a running diversity penalty per (namespace, type). Stage 4
//! sorts, stable, ties broken by identifier.
//!
//! One `find_batch` against the metadata store materializes everything
//! the signals need; the ranker performs no other I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AtlasResult;
use crate::store::MetadataStore;
use crate::types::{Candidate, CandidateSource, Classification, ExtractedUnit};

/// RRF constant.
pub const RRF_K: f64 = 60.0;

/// Signal weights; they sum to 1.0.
const WEIGHT_SEMANTIC: f64 = 0.40;
const WEIGHT_KEYWORD: f64 = 0.10;
const WEIGHT_RECENCY: f64 = 0.10;
const WEIGHT_IMPORTANCE: f64 = 0.15;
const WEIGHT_TYPE_MATCH: f64 = 0.15;
const WEIGHT_DIVERSITY: f64 = 0.10;

/// Keyword-signal floor for non-keyword sources.
const KEYWORD_BASE: f64 = 0.3;

/// Per-duplicate diversity penalty step and its cap.
const DIVERSITY_STEP: f64 = 0.15;
const DIVERSITY_CAP: f64 = 0.5;

/// The six scoring signals, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SignalBreakdown {
    /// Fused (or raw single-source) relevance.
    pub semantic: f64,
    /// Keyword affinity.
    pub keyword: f64,
    /// Git change-frequency recency.
    pub recency: f64,
    /// Tagged importance.
    pub importance: f64,
    /// Classification target-type agreement.
    pub type_match: f64,
    /// One minus the namespace-flood penalty.
    pub diversity: f64,
}

impl SignalBreakdown {
    /// The weighted sum that becomes the final score.
    pub fn weighted(&self) -> f64 {
        WEIGHT_SEMANTIC * self.semantic
            + WEIGHT_KEYWORD * self.keyword
            + WEIGHT_RECENCY * self.recency
            + WEIGHT_IMPORTANCE * self.importance
            + WEIGHT_TYPE_MATCH * self.type_match
            + WEIGHT_DIVERSITY * self.diversity
    }
}

/// A candidate after fusion and scoring, with its materialized record.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    /// Unit identifier (unique in ranker output).
    pub identifier: String,
    /// Final weighted score.
    pub score: f64,
    /// Strongest source that proposed this unit.
    pub source: CandidateSource,
    /// Merged candidate metadata.
    pub metadata: crate::types::Metadata,
    /// The unit record, when the metadata store has it.
    pub unit: Option<ExtractedUnit>,
    /// How the score decomposes.
    pub signals: SignalBreakdown,
}

/// Merges multi-source candidates and applies weighted signal scoring.
pub struct Ranker {
    metadata: Arc<dyn MetadataStore>,
}

impl Ranker {
    /// Build a ranker over a shared metadata store handle.
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Rank a flat candidate list (duplicates across sources allowed).
    pub fn rank(
        &self,
        candidates: Vec<Candidate>,
        classification: &Classification,
    ) -> AtlasResult<Vec<RankedCandidate>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Stage 1: rank fusion.
        let fused = fuse(candidates);

        // Materialize unit records once for all signal lookups.
        let ids: Vec<String> = fused.iter().map(|c| c.identifier.clone()).collect();
        let records = self.metadata.find_batch(&ids)?;

        // Stage 2 + 3: signal scoring with the running diversity penalty,
        // processed in descending pre-penalty score order.
        let mut working: Vec<(Candidate, Option<ExtractedUnit>)> = fused
            .into_iter()
            .map(|c| {
                let record = records.get(&c.identifier).cloned();
                (c, record)
            })
            .collect();
        working.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.identifier.cmp(&b.0.identifier))
        });

        let mut seen: BTreeMap<(String, String), usize> = BTreeMap::new();
        let mut ranked: Vec<RankedCandidate> = working
            .into_iter()
            .map(|(candidate, unit)| {
                let bucket = diversity_bucket(&candidate, unit.as_ref());
                let prior = *seen.get(&bucket).unwrap_or(&0);
                seen.insert(bucket, prior + 1);
                let penalty = (DIVERSITY_STEP * prior as f64).min(DIVERSITY_CAP);

                let signals = SignalBreakdown {
                    semantic: candidate.score,
                    keyword: if candidate.source == CandidateSource::Keyword {
                        candidate.score
                    } else {
                        KEYWORD_BASE
                    },
                    recency: recency_signal(unit.as_ref()),
                    importance: importance_signal(unit.as_ref()),
                    type_match: type_match_signal(classification, &candidate, unit.as_ref()),
                    diversity: 1.0 - penalty,
                };

                RankedCandidate {
                    identifier: candidate.identifier,
                    score: signals.weighted(),
                    source: candidate.source,
                    metadata: candidate.metadata,
                    unit,
                    signals,
                }
            })
            .collect();

        // Stage 4: stable sort by weighted score, ties by identifier.
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });

        Ok(ranked)
    }
}

/// Stage 1: Reciprocal Rank Fusion across sources.
///
/// With two or more distinct sources in play, every identifier's fused
/// score is Σ 1/(K + rank) over the per-source rank lists it appears
/// in, so corroboration across sources always outranks a lone hit.
/// A single-source list skips fusion; duplicates within it collapse to
/// the best raw score.
fn fuse(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let distinct_sources: std::collections::BTreeSet<CandidateSource> =
        candidates.iter().map(|c| c.source).collect();

    if distinct_sources.len() < 2 {
        // No fusion: dedupe keeping the best raw score.
        let mut out: Vec<Candidate> = Vec::new();
        for candidate in candidates {
            match out.iter().position(|c| c.identifier == candidate.identifier) {
                Some(i) => {
                    if candidate.score > out[i].score {
                        out[i].score = candidate.score;
                    }
                    merge_metadata(&mut out[i].metadata, &candidate.metadata);
                }
                None => out.push(candidate),
            }
        }
        return out;
    }

    // Per-source rank lists, sorted by raw score descending.
    let mut per_source: BTreeMap<CandidateSource, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        per_source.entry(candidate.source).or_default().push(candidate);
    }

    #[derive(Default)]
    struct Accumulated {
        rrf: f64,
        source: Option<CandidateSource>,
        metadata: crate::types::Metadata,
    }

    let mut accumulated: BTreeMap<String, Accumulated> = BTreeMap::new();

    for (source, mut list) in per_source {
        list.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });

        let mut rank = 0usize;
        let mut seen = std::collections::BTreeSet::new();
        for candidate in list {
            // The same id twice in one source keeps only its best rank.
            if !seen.insert(candidate.identifier.clone()) {
                continue;
            }
            rank += 1;

            let entry = accumulated.entry(candidate.identifier.clone()).or_default();
            entry.rrf += 1.0 / (RRF_K + rank as f64);
            merge_metadata(&mut entry.metadata, &candidate.metadata);
            entry.source = Some(match entry.source {
                Some(existing) if existing.strength() >= source.strength() => existing,
                _ => source,
            });
        }
    }

    accumulated
        .into_iter()
        .map(|(identifier, acc)| Candidate {
            identifier,
            score: acc.rrf,
            source: acc.source.unwrap_or(CandidateSource::Keyword),
            metadata: acc.metadata,
        })
        .collect()
}

/// Last-write wins for scalars, concatenation for lists.
fn merge_metadata(into: &mut crate::types::Metadata, from: &crate::types::Metadata) {
    for (key, value) in from {
        if let serde_json::Value::Array(incoming) = value {
            if let Some(serde_json::Value::Array(existing)) = into.get_mut(key) {
                existing.extend(incoming.iter().cloned());
                continue;
            }
        }
        into.insert(key.clone(), value.clone());
    }
}

fn diversity_bucket(candidate: &Candidate, unit: Option<&ExtractedUnit>) -> (String, String) {
    match unit {
        Some(u) => (u.namespace.clone(), u.unit_type.as_str().to_string()),
        None => {
            let type_hint = candidate
                .metadata
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            (String::new(), type_hint)
        }
    }
}

fn recency_signal(unit: Option<&ExtractedUnit>) -> f64 {
    let frequency = unit
        .and_then(|u| u.metadata.get("git"))
        .and_then(|git| git.get("change_frequency"))
        .and_then(|v| v.as_str());
    match frequency {
        Some("hot") => 1.0,
        Some("warm") => 0.7,
        Some("dormant") => 0.3,
        _ => 0.5,
    }
}

fn importance_signal(unit: Option<&ExtractedUnit>) -> f64 {
    let importance = unit
        .and_then(|u| u.metadata.get("importance"))
        .and_then(|v| v.as_str());
    match importance {
        Some("high") => 1.0,
        Some("medium") => 0.7,
        Some("low") => 0.5,
        _ => 0.3,
    }
}

fn type_match_signal(
    classification: &Classification,
    candidate: &Candidate,
    unit: Option<&ExtractedUnit>,
) -> f64 {
    let Some(target) = classification.target_type else {
        return 0.5;
    };
    let unit_type = unit.map(|u| u.unit_type).or_else(|| {
        candidate
            .metadata
            .get("type")
            .and_then(|v| v.as_str())
            .and_then(crate::types::UnitType::parse)
    });
    match unit_type {
        Some(t) if t == target => 1.0,
        _ => 0.0,
    }
}
