//! Token-budgeted, section-structured context assembly.
//!
//! Single-pass greedy packing: each section over-reserves its fraction
//! of the budget and rolls unused allowance forward into later
//! sections, so assembly is O(n) in candidates with no backtracking.
//!
//! All accounting uses the deterministic `ceil(bytes / 4)` estimator;
//! the budget invariant is `tokens_used <= budget + 50 per included
//! unit` (the header allowance).

use crate::types::{
    estimate_tokens, AssembledContext, CandidateSource, Classification, ExtractedUnit, Section,
    SourceRef, UnitType,
};
use crate::ranker::RankedCandidate;

/// Token allowance reserved for a unit header when truncating.
pub const HEADER_ALLOWANCE: usize = 50;

/// A truncated unit must still carry at least this many body tokens to
/// be worth emitting; below that it is skipped entirely.
pub const MIN_USEFUL_TOKENS: usize = 200;

/// Marker appended to truncated source text.
const TRUNCATION_MARKER: &str = "… [truncated]";

/// Divider between sections.
const SECTION_DIVIDER: &str = "\n---\n\n";

/// Default token budget when the caller does not override it.
pub const DEFAULT_BUDGET: usize = 8000;

/// Builds a section-ordered, budgeted context from ranked candidates.
pub struct ContextAssembler {
    budget: usize,
}

impl ContextAssembler {
    /// An assembler with the given hard token budget.
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// Assemble the context.
    ///
    /// `structural` is the caller-provided codebase overview; it fills
    /// the structural section when present.
    pub fn assemble(
        &self,
        ranked: &[RankedCandidate],
        classification: &Classification,
        structural: Option<&str>,
    ) -> AssembledContext {
        let mut context = AssembledContext::empty(self.budget);
        let mut carry = 0usize;

        for section in Section::ORDER {
            let allowance =
                (section.budget_fraction() * self.budget as f64).floor() as usize + carry;
            let used = match section {
                Section::Structural => {
                    self.emit_structural(&mut context, structural, allowance)
                }
                Section::Primary | Section::Supporting | Section::Framework => self
                    .emit_candidates(
                        &mut context,
                        ranked,
                        classification,
                        section,
                        allowance,
                    ),
            };
            carry = allowance.saturating_sub(used);
        }

        context
    }

    fn emit_structural(
        &self,
        context: &mut AssembledContext,
        structural: Option<&str>,
        allowance: usize,
    ) -> usize {
        let Some(text) = structural else { return 0 };
        if text.is_empty() {
            return 0;
        }

        let tokens = estimate_tokens(text);
        if tokens > allowance || context.tokens_used + tokens > self.budget {
            return 0;
        }

        self.open_section(context, Section::Structural);
        context.text.push_str(text);
        if !text.ends_with('\n') {
            context.text.push('\n');
        }
        context.tokens_used += tokens;
        tokens
    }

    fn emit_candidates(
        &self,
        context: &mut AssembledContext,
        ranked: &[RankedCandidate],
        classification: &Classification,
        section: Section,
        allowance: usize,
    ) -> usize {
        let mut used = 0usize;

        for candidate in ranked {
            if !belongs_to_section(candidate, classification, section) {
                continue;
            }
            // Hard budget: later candidates are dropped, never partially
            // included past the total.
            if context.tokens_used >= self.budget {
                break;
            }
            let Some(unit) = candidate.unit.as_ref() else {
                tracing::debug!(identifier = %candidate.identifier, "no record for ranked candidate, skipping");
                continue;
            };

            let header = unit_header(unit);
            let header_tokens = estimate_tokens(&header);
            let body = unit.source_code.as_deref().unwrap_or("");
            let body_tokens = estimate_tokens(body);

            let remaining = allowance.saturating_sub(used);
            let full_tokens = header_tokens + body_tokens;

            let (emitted_text, emitted_tokens, truncated) = if full_tokens <= remaining {
                (format!("{header}{body}\n\n"), full_tokens, false)
            } else if remaining >= HEADER_ALLOWANCE + MIN_USEFUL_TOKENS {
                let target_bytes =
                    remaining.saturating_sub(HEADER_ALLOWANCE) * 4;
                let truncated_body = truncate_on_char_boundary(
                    body,
                    target_bytes.saturating_sub(TRUNCATION_MARKER.len()),
                );
                let text = format!("{header}{truncated_body}{TRUNCATION_MARKER}\n\n");
                let tokens = header_tokens
                    + estimate_tokens(&format!("{truncated_body}{TRUNCATION_MARKER}"));
                (text, tokens, true)
            } else {
                // Header plus a useful body cannot fit; skip entirely.
                continue;
            };

            if context.tokens_used + emitted_tokens > self.budget + HEADER_ALLOWANCE {
                continue;
            }

            self.open_section(context, section);
            context.text.push_str(&emitted_text);
            context.tokens_used += emitted_tokens;
            used += emitted_tokens;
            context.sources.push(SourceRef {
                identifier: unit.identifier.clone(),
                unit_type: unit.unit_type,
                score: candidate.score,
                file_path: unit.file_path.clone(),
                truncated,
            });
        }

        used
    }

    fn open_section(&self, context: &mut AssembledContext, section: Section) {
        if context.sections.last() == Some(&section) {
            return;
        }
        if !context.sections.is_empty() {
            context.text.push_str(SECTION_DIVIDER);
            // Dividers are cheap but still budgeted.
            context.tokens_used += estimate_tokens(SECTION_DIVIDER);
        }
        context.sections.push(section);
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET)
    }
}

/// Section membership for one ranked candidate.
fn belongs_to_section(
    candidate: &RankedCandidate,
    classification: &Classification,
    section: Section,
) -> bool {
    let is_framework = classification.framework_context
        && candidate
            .unit
            .as_ref()
            .is_some_and(|u| u.unit_type == UnitType::RailsSource);

    match section {
        Section::Structural => false,
        Section::Framework => is_framework,
        Section::Primary => !is_framework && candidate.source != CandidateSource::GraphExpansion,
        Section::Supporting => {
            !is_framework && candidate.source == CandidateSource::GraphExpansion
        }
    }
}

/// `## <identifier> (<type>)` plus the file path line.
fn unit_header(unit: &ExtractedUnit) -> String {
    format!("## {} ({})\n{}\n\n", unit.identifier, unit.unit_type, unit.file_path)
}

/// Truncate to at most `max_bytes`, backing up to a char boundary.
fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::QueryClassifier;
    use crate::ranker::SignalBreakdown;
    use crate::types::Classification;

    fn ranked_unit(
        id: &str,
        unit_type: UnitType,
        source: CandidateSource,
        score: f64,
        body: &str,
    ) -> RankedCandidate {
        let mut unit = ExtractedUnit::new(unit_type, id, format!("app/{}.rb", id.to_lowercase()));
        unit.source_code = Some(body.to_string());
        RankedCandidate {
            identifier: id.to_string(),
            score,
            source,
            metadata: crate::types::Metadata::new(),
            unit: Some(unit),
            signals: SignalBreakdown::default(),
        }
    }

    fn classification() -> Classification {
        QueryClassifier::classify("tell about posts")
    }

    #[test]
    fn test_empty_input_empty_context() {
        let assembler = ContextAssembler::new(1000);
        let context = assembler.assemble(&[], &classification(), None);
        assert_eq!(context.tokens_used, 0);
        assert!(context.text.is_empty());
        assert!(context.sources.is_empty());
        assert!(context.sections.is_empty());
    }

    #[test]
    fn test_structural_section_first() {
        let assembler = ContextAssembler::new(1000);
        let ranked =
            vec![ranked_unit("Post", UnitType::Model, CandidateSource::Vector, 0.9, "class Post\nend")];
        let context =
            assembler.assemble(&ranked, &classification(), Some("Codebase: 6 units (3 models)"));

        assert!(context.text.starts_with("Codebase: 6 units"));
        assert_eq!(context.sections, vec![Section::Structural, Section::Primary]);
        assert!(context.text.contains("---"));
    }

    #[test]
    fn test_primary_excludes_graph_expansion() {
        let assembler = ContextAssembler::new(2000);
        let ranked = vec![
            ranked_unit("Post", UnitType::Model, CandidateSource::Vector, 0.9, "class Post\nend"),
            ranked_unit(
                "Comment",
                UnitType::Model,
                CandidateSource::GraphExpansion,
                0.5,
                "class Comment\nend",
            ),
        ];
        let context = assembler.assemble(&ranked, &classification(), None);

        assert_eq!(context.sections, vec![Section::Primary, Section::Supporting]);
        let primary_end = context.text.find("---").expect("divider");
        let primary = &context.text[..primary_end];
        assert!(primary.contains("## Post"));
        assert!(!primary.contains("## Comment"));
    }

    #[test]
    fn test_framework_section_pulls_rails_source() {
        let assembler = ContextAssembler::new(4000);
        let classification = QueryClassifier::classify("how does activerecord handle callbacks");
        assert!(classification.framework_context);

        let ranked = vec![
            ranked_unit(
                "ActiveRecord::Callbacks",
                UnitType::RailsSource,
                CandidateSource::Vector,
                0.9,
                "module Callbacks\nend",
            ),
            ranked_unit("User", UnitType::Model, CandidateSource::Vector, 0.8, "class User\nend"),
        ];
        let context = assembler.assemble(&ranked, &classification, None);

        assert_eq!(context.sections, vec![Section::Primary, Section::Framework]);
        // The rails_source unit appears once, in the framework section only.
        let occurrences = context.text.matches("## ActiveRecord::Callbacks").count();
        assert_eq!(occurrences, 1);
        let framework_start = context.text.rfind("---").expect("divider");
        assert!(context.text[framework_start..].contains("## ActiveRecord::Callbacks"));
    }

    #[test]
    fn test_budget_invariant_holds() {
        let budget = 500;
        let assembler = ContextAssembler::new(budget);
        let big_body = "x".repeat(10_000);
        let ranked: Vec<RankedCandidate> = (0..6)
            .map(|i| {
                ranked_unit(
                    &format!("Unit{i}"),
                    UnitType::Model,
                    CandidateSource::Vector,
                    0.9,
                    &big_body,
                )
            })
            .collect();
        let context = assembler.assemble(&ranked, &classification(), None);

        let slack = HEADER_ALLOWANCE * context.sources.len().max(1);
        assert!(
            context.tokens_used <= budget + slack,
            "tokens_used {} exceeds budget {budget} + slack {slack}",
            context.tokens_used
        );
    }

    #[test]
    fn test_single_enormous_unit_truncated() {
        let assembler = ContextAssembler::new(1000);
        let big_body = "y".repeat(50_000);
        let ranked = vec![ranked_unit(
            "Giant",
            UnitType::Model,
            CandidateSource::Vector,
            0.9,
            &big_body,
        )];
        let context = assembler.assemble(&ranked, &classification(), None);

        assert_eq!(context.sources.len(), 1);
        assert!(context.sources[0].truncated);
        assert!(context.text.contains("## Giant"));
        assert!(context.text.contains("… [truncated]"));
        assert!(context.tokens_used <= 1000 + HEADER_ALLOWANCE);
    }

    #[test]
    fn test_unit_too_small_to_truncate_is_skipped() {
        // Budget so small that header + MIN_USEFUL cannot fit.
        let assembler = ContextAssembler::new(100);
        let ranked = vec![ranked_unit(
            "Giant",
            UnitType::Model,
            CandidateSource::Vector,
            0.9,
            &"z".repeat(10_000),
        )];
        let context = assembler.assemble(&ranked, &classification(), None);
        assert!(context.sources.is_empty());
        assert_eq!(context.tokens_used, 0);
    }

    #[test]
    fn test_unused_budget_rolls_forward() {
        // Structural absent: its 10% joins primary, letting a unit
        // slightly over the bare primary fraction fit untruncated.
        let budget = 1000;
        let assembler = ContextAssembler::new(budget);
        // Primary alone is 450 tokens; with the structural 100 rolled
        // forward the allowance is 550.
        let body = "a".repeat(480 * 4);
        let ranked =
            vec![ranked_unit("Post", UnitType::Model, CandidateSource::Vector, 0.9, &body)];
        let context = assembler.assemble(&ranked, &classification(), None);

        assert_eq!(context.sources.len(), 1);
        assert!(!context.sources[0].truncated, "roll-forward should avoid truncation");
    }

    #[test]
    fn test_sources_record_score_and_path() {
        let assembler = ContextAssembler::new(2000);
        let ranked =
            vec![ranked_unit("Post", UnitType::Model, CandidateSource::Vector, 0.7321, "class Post\nend")];
        let context = assembler.assemble(&ranked, &classification(), None);
        assert_eq!(context.sources.len(), 1);
        let source = &context.sources[0];
        assert_eq!(source.identifier, "Post");
        assert_eq!(source.unit_type, UnitType::Model);
        assert!((source.score - 0.7321).abs() < 1e-9);
        assert_eq!(source.file_path, "app/post.rb");
        assert!(!source.truncated);
    }

    #[test]
    fn test_candidate_without_record_is_skipped() {
        let assembler = ContextAssembler::new(2000);
        let ghost = RankedCandidate {
            identifier: "Ghost".into(),
            score: 0.9,
            source: CandidateSource::Vector,
            metadata: crate::types::Metadata::new(),
            unit: None,
            signals: SignalBreakdown::default(),
        };
        let context = assembler.assemble(&[ghost], &classification(), None);
        assert!(context.sources.is_empty());
    }
}
