//! Core domain types shared across all atlas-core subsystems.
//!
//! These types form the API contract between modules. Changing them
//! requires updating all consumers, so they should be stable and minimal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Open metadata map attached to units and candidates.
///
/// String keys, JSON-serializable values. BTreeMap keeps serialization
/// deterministic, which the content hasher relies on.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Unit types
// ---------------------------------------------------------------------------

/// The closed set of extracted program-element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    /// ActiveRecord model.
    Model,
    /// Request controller.
    Controller,
    /// Service object / interactor.
    Service,
    /// Background job.
    Job,
    /// Mailer.
    Mailer,
    /// View component.
    Component,
    /// GraphQL type definition.
    GraphqlType,
    /// GraphQL mutation.
    GraphqlMutation,
    /// GraphQL resolver.
    GraphqlResolver,
    /// Framework source vendored into the index.
    RailsSource,
    /// Presentation decorator.
    Decorator,
    /// Mixin concern (inlined into includers at extraction).
    Concern,
    /// Authorization policy.
    Policy,
    /// Custom validator.
    Validator,
    /// Manager / coordinator object.
    Manager,
    /// Plain Ruby class outside the framework taxonomy.
    RubyClass,
    /// Individual method extracted as its own unit.
    RubyMethod,
}

impl UnitType {
    /// All members of the closed set, in declaration order.
    pub const ALL: [UnitType; 17] = [
        Self::Model,
        Self::Controller,
        Self::Service,
        Self::Job,
        Self::Mailer,
        Self::Component,
        Self::GraphqlType,
        Self::GraphqlMutation,
        Self::GraphqlResolver,
        Self::RailsSource,
        Self::Decorator,
        Self::Concern,
        Self::Policy,
        Self::Validator,
        Self::Manager,
        Self::RubyClass,
        Self::RubyMethod,
    ];

    /// Convert to the storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Controller => "controller",
            Self::Service => "service",
            Self::Job => "job",
            Self::Mailer => "mailer",
            Self::Component => "component",
            Self::GraphqlType => "graphql_type",
            Self::GraphqlMutation => "graphql_mutation",
            Self::GraphqlResolver => "graphql_resolver",
            Self::RailsSource => "rails_source",
            Self::Decorator => "decorator",
            Self::Concern => "concern",
            Self::Policy => "policy",
            Self::Validator => "validator",
            Self::Manager => "manager",
            Self::RubyClass => "ruby_class",
            Self::RubyMethod => "ruby_method",
        }
    }

    /// Parse from a storage string. Returns None for anything outside the set.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// The directory name units of this type live under in the index dir.
    pub fn dir_name(&self) -> String {
        format!("{}s", self.as_str())
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// How a dependency edge was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyVia {
    /// ActiveRecord association (belongs_to, has_many, ...).
    Association,
    /// Constant reference in source.
    CodeReference,
    /// Direct method call.
    MethodCall,
    /// Class inheritance.
    Inheritance,
    /// Module include.
    Include,
    /// Module extend.
    Extend,
    /// Any other recorded reference.
    Reference,
}

impl DependencyVia {
    /// Convert to the storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Association => "association",
            Self::CodeReference => "code_reference",
            Self::MethodCall => "method_call",
            Self::Inheritance => "inheritance",
            Self::Include => "include",
            Self::Extend => "extend",
            Self::Reference => "reference",
        }
    }

    /// Parse from a storage string, falling back to `Reference`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "association" => Self::Association,
            "code_reference" => Self::CodeReference,
            "method_call" => Self::MethodCall,
            "inheritance" => Self::Inheritance,
            "include" => Self::Include,
            "extend" => Self::Extend,
            _ => Self::Reference,
        }
    }
}

/// A directed dependency from one unit to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Identifier of the unit depended on.
    pub target: String,
    /// Free-form relationship label (e.g. "belongs_to", "calls").
    #[serde(rename = "type")]
    pub dep_type: String,
    /// How the edge was discovered.
    pub via: DependencyVia,
}

// ---------------------------------------------------------------------------
// Extracted units and chunks
// ---------------------------------------------------------------------------

/// The kind of sub-unit fragment a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Generated prose summary of the unit.
    Summary,
    /// Association declarations.
    Associations,
    /// Validation declarations.
    Validations,
    /// Callback declarations.
    Callbacks,
    /// Method bodies.
    Methods,
    /// Named scopes.
    Scopes,
    /// A single controller action (chunk carries the action name).
    Action,
    /// The whole unit as one fragment.
    Whole,
}

impl ChunkKind {
    /// Convert to the storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Associations => "associations",
            Self::Validations => "validations",
            Self::Callbacks => "callbacks",
            Self::Methods => "methods",
            Self::Scopes => "scopes",
            Self::Action => "action",
            Self::Whole => "whole",
        }
    }

    /// Parse from a storage string, falling back to `Whole`.
    /// `action_*` tags collapse to `Action`; the suffix rides in `Chunk::name`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "summary" => Self::Summary,
            "associations" => Self::Associations,
            "validations" => Self::Validations,
            "callbacks" => Self::Callbacks,
            "methods" => Self::Methods,
            "scopes" => Self::Scopes,
            s if s == "action" || s.starts_with("action_") => Self::Action,
            _ => Self::Whole,
        }
    }
}

/// A semantically-labeled fragment of a unit, separately embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Identifier of the parent unit.
    pub unit_identifier: String,
    /// Semantic kind of this fragment.
    pub kind: ChunkKind,
    /// Optional fragment name (e.g. the action name for `Action` chunks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The fragment text.
    pub content: String,
}

impl Chunk {
    /// The vector-store id for this chunk: `<unit>::chunk#<kind>[.<name>]`.
    pub fn vector_id(&self) -> String {
        match &self.name {
            Some(name) => format!("{}::chunk#{}.{name}", self.unit_identifier, self.kind.as_str()),
            None => format!("{}::chunk#{}", self.unit_identifier, self.kind.as_str()),
        }
    }
}

/// An extracted program element -- the indivisible object of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedUnit {
    /// Unit kind from the closed set.
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    /// Globally unique name; may contain `::` and `#`.
    pub identifier: String,
    /// Enclosing namespace ("" for top level).
    #[serde(default)]
    pub namespace: String,
    /// Repository-relative source path.
    pub file_path: String,
    /// Raw source text, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    /// Open metadata map.
    #[serde(default)]
    pub metadata: Metadata,
    /// Outgoing dependency edges, in extraction order.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Sub-unit fragments, when the extractor chunked this unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,
}

impl ExtractedUnit {
    /// Minimal constructor for a unit with no source or metadata.
    pub fn new(unit_type: UnitType, identifier: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            unit_type,
            identifier: identifier.into(),
            namespace: String::new(),
            file_path: file_path.into(),
            source_code: None,
            metadata: Metadata::new(),
            dependencies: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Text used for embedding: source when present, else a header line.
    pub fn embedding_text(&self) -> String {
        match &self.source_code {
            Some(src) => format!("{} ({})\n{src}", self.identifier, self.unit_type),
            None => format!("{} ({}) in {}", self.identifier, self.unit_type, self.file_path),
        }
    }
}

// ---------------------------------------------------------------------------
// Search candidates
// ---------------------------------------------------------------------------

/// Which search strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Vector similarity search.
    Vector,
    /// Substring keyword search.
    Keyword,
    /// Graph seed resolution.
    Graph,
    /// Neighbor pulled in by graph expansion.
    GraphExpansion,
    /// Exact identifier lookup.
    Direct,
}

impl CandidateSource {
    /// Convert to the storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Graph => "graph",
            Self::GraphExpansion => "graph_expansion",
            Self::Direct => "direct",
        }
    }

    /// Relative strength used when merging duplicate candidates:
    /// a direct hit is the strongest provenance, expansion the weakest.
    pub fn strength(&self) -> u8 {
        match self {
            Self::Direct => 4,
            Self::Graph => 3,
            Self::Vector => 2,
            Self::Keyword => 1,
            Self::GraphExpansion => 0,
        }
    }
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit proposed by a search strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Identifier of the proposed unit.
    pub identifier: String,
    /// Provisional relevance score in [0, 1].
    pub score: f64,
    /// Which strategy proposed it.
    pub source: CandidateSource,
    /// Metadata carried from the store hit.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Candidate {
    /// Construct a candidate with empty metadata.
    pub fn new(identifier: impl Into<String>, score: f64, source: CandidateSource) -> Self {
        Self {
            identifier: identifier.into(),
            score,
            source,
            metadata: Metadata::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query classification
// ---------------------------------------------------------------------------

/// What the caller is trying to accomplish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Understand how something works (default).
    Understand,
    /// Find where something lives.
    Locate,
    /// Follow a call / dependency path.
    Trace,
    /// Fix a defect.
    Debug,
    /// Add new code following existing patterns.
    Implement,
    /// Enumerate an API surface.
    Reference,
    /// Contrast two things.
    Compare,
    /// Question about the framework itself.
    Framework,
}

/// How wide a net the answer should cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One exact unit.
    Pinpoint,
    /// A handful of closely-related units (default).
    Focused,
    /// Related and similar units welcome.
    Exploratory,
    /// Everything relevant.
    Comprehensive,
}

/// The strategy taken by the search executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Exact identifier lookup.
    Direct,
    /// Substring keyword search.
    Keyword,
    /// Embedding similarity search.
    Vector,
    /// Graph seed + neighbor expansion.
    Graph,
    /// Union of vector, keyword, and graph expansion.
    Hybrid,
}

impl Strategy {
    /// Convert to the trace string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Keyword => "keyword",
            Self::Vector => "vector",
            Self::Graph => "graph",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the query classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Detected intent.
    pub intent: Intent,
    /// Detected scope.
    pub scope: Scope,
    /// Unit type the query names, if any.
    pub target_type: Option<UnitType>,
    /// Whether the query mentions the framework itself.
    pub framework_context: bool,
    /// Deduplicated, lowercased, stop-word-filtered keywords in
    /// first-occurrence order.
    pub keywords: Vec<String>,
}

// ---------------------------------------------------------------------------
// Assembled context
// ---------------------------------------------------------------------------

/// A budgeted region of the assembled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// Caller-provided codebase overview.
    Structural,
    /// Direct search hits.
    Primary,
    /// Graph-expansion neighbors.
    Supporting,
    /// Framework-source units for framework questions.
    Framework,
}

impl Section {
    /// All sections in emission order.
    pub const ORDER: [Section; 4] =
        [Self::Structural, Self::Primary, Self::Supporting, Self::Framework];

    /// Fraction of the total budget reserved for this section.
    pub fn budget_fraction(&self) -> f64 {
        match self {
            Self::Structural => 0.10,
            Self::Primary => 0.45,
            Self::Supporting => 0.25,
            Self::Framework => 0.20,
        }
    }

    /// Convert to the display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Primary => "primary",
            Self::Supporting => "supporting",
            Self::Framework => "framework",
        }
    }
}

/// Source attribution for one emitted unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Identifier of the emitted unit.
    pub identifier: String,
    /// Unit kind.
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    /// Final ranked score.
    pub score: f64,
    /// Repository-relative path.
    pub file_path: String,
    /// Whether the source text was truncated to fit the budget.
    #[serde(default)]
    pub truncated: bool,
}

/// A token-budgeted text context assembled from ranked candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledContext {
    /// The rendered context text.
    pub text: String,
    /// Estimated tokens consumed.
    pub tokens_used: usize,
    /// Budget the context was assembled for.
    pub budget: usize,
    /// One entry per emitted unit per section.
    pub sources: Vec<SourceRef>,
    /// Sections that actually emitted content, in order.
    pub sections: Vec<Section>,
}

impl AssembledContext {
    /// An empty context for the given budget.
    pub fn empty(budget: usize) -> Self {
        Self {
            text: String::new(),
            tokens_used: 0,
            budget,
            sources: Vec::new(),
            sections: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retrieval result and trace
// ---------------------------------------------------------------------------

/// Outcome status of a single pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed normally.
    Ok,
    /// Stage completed with reduced capability.
    Degraded,
    /// Stage was skipped (e.g. nothing to rank).
    Skipped,
    /// Stage failed outright.
    Failed,
}

/// One recorded pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Stage name (classify, search, rank, assemble).
    pub stage: String,
    /// Outcome.
    pub status: StageStatus,
    /// Monotonic elapsed milliseconds from retrieval start.
    pub elapsed_ms: u64,
    /// Candidate / unit counts relevant to the stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counts: BTreeMap<String, usize>,
    /// Stage-specific extras (strategy, score ranges, reasons).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Ordered stage events plus overall timing and degradation flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalTrace {
    /// Stage events in execution order.
    pub stages: Vec<StageEvent>,
    /// Total wall time for the retrieval.
    pub total_ms: u64,
    /// Whether any stage degraded.
    pub degraded: bool,
}

impl RetrievalTrace {
    /// Append a stage event, folding its degradation into the trace flag.
    pub fn push(&mut self, event: StageEvent) {
        if matches!(event.status, StageStatus::Degraded | StageStatus::Failed) {
            self.degraded = true;
        }
        self.stages.push(event);
    }
}

/// The complete output of one retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// The assembled, budgeted context.
    pub context: AssembledContext,
    /// Strategy the executor chose (after any degradation).
    pub strategy: Strategy,
    /// The query classification.
    pub classification: Classification,
    /// Diagnostic trace.
    pub trace: RetrievalTrace,
    /// Whether the pipeline degraded below its chosen tier.
    pub degraded: bool,
    /// Why it degraded, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Deterministic token estimate: `ceil(bytes / 4)`.
///
/// Underestimates code by 15-25% versus a real tokenizer; budget
/// assertions throughout use this estimator so they stay deterministic.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_type_round_trip() {
        for t in UnitType::ALL {
            assert_eq!(UnitType::parse(t.as_str()), Some(t));
        }
        assert_eq!(UnitType::parse("widget"), None);
    }

    #[test]
    fn test_unit_type_dir_name() {
        assert_eq!(UnitType::Model.dir_name(), "models");
        assert_eq!(UnitType::RailsSource.dir_name(), "rails_sources");
    }

    #[test]
    fn test_dependency_via_lossy_fallback() {
        assert_eq!(DependencyVia::from_str_lossy("include"), DependencyVia::Include);
        assert_eq!(DependencyVia::from_str_lossy("whatever"), DependencyVia::Reference);
    }

    #[test]
    fn test_chunk_vector_id() {
        let chunk = Chunk {
            unit_identifier: "User".into(),
            kind: ChunkKind::Validations,
            name: None,
            content: "validates :email".into(),
        };
        assert_eq!(chunk.vector_id(), "User::chunk#validations");

        let action = Chunk {
            unit_identifier: "PostsController".into(),
            kind: ChunkKind::Action,
            name: Some("create".into()),
            content: "def create; end".into(),
        };
        assert_eq!(action.vector_id(), "PostsController::chunk#action.create");
    }

    #[test]
    fn test_action_chunk_kind_parses_prefixed_tags() {
        assert_eq!(ChunkKind::from_str_lossy("action_create"), ChunkKind::Action);
        assert_eq!(ChunkKind::from_str_lossy("action"), ChunkKind::Action);
        assert_eq!(ChunkKind::from_str_lossy("garbage"), ChunkKind::Whole);
    }

    #[test]
    fn test_source_strength_ordering() {
        assert!(CandidateSource::Direct.strength() > CandidateSource::Vector.strength());
        assert!(CandidateSource::Vector.strength() > CandidateSource::GraphExpansion.strength());
    }

    #[test]
    fn test_section_fractions_sum_to_one() {
        let total: f64 = Section::ORDER.iter().map(Section::budget_fraction).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_tokens_ceil() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_trace_degradation_folds_up() {
        let mut trace = RetrievalTrace::default();
        trace.push(StageEvent {
            stage: "classify".into(),
            status: StageStatus::Ok,
            elapsed_ms: 1,
            counts: BTreeMap::new(),
            extra: BTreeMap::new(),
        });
        assert!(!trace.degraded);
        trace.push(StageEvent {
            stage: "search".into(),
            status: StageStatus::Degraded,
            elapsed_ms: 2,
            counts: BTreeMap::new(),
            extra: BTreeMap::new(),
        });
        assert!(trace.degraded);
    }
}
