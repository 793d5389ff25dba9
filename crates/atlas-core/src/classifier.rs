//! Query classification for strategy selection.
//!
//! A pure function from the raw query string to a [`Classification`]:
//! intent, scope, optional target unit type, framework context, and the
//! extracted keywords. Deterministic and allocation-light; called once
//! per retrieval.
//!
//! Intent rules are checked in priority order -- the first match wins.
//! All matching is whole-word over the lowercased token stream, so
//! "updated" never triggers "update"-style rules.

use crate::types::{Classification, Intent, Scope, UnitType};

/// Framework names that flip `framework_context` and participate in the
/// framework-intent rule.
const FRAMEWORK_NAMES: &[&str] = &[
    "rails",
    "activerecord",
    "activejob",
    "actionpack",
    "actioncable",
    "activestorage",
    "actionmailer",
    "activesupport",
    "actionview",
    "sidekiq",
    "graphql",
    "devise",
    "pundit",
    "turbo",
    "hotwire",
];

/// Tokens dropped from the keyword list.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "do", "does", "did",
    "how", "what", "where", "when", "who", "why", "which", "me", "my", "i", "we", "you", "your",
    "they", "them", "their", "it", "its", "this", "that", "these", "those", "to", "of", "in",
    "on", "for", "with", "and", "or", "not", "at", "by", "from", "as", "into", "about", "can",
    "could", "would", "should", "show", "tell", "please", "there", "here",
];

/// Query classifier: string in, [`Classification`] out.
pub struct QueryClassifier;

impl QueryClassifier {
    /// Classify a query.
    pub fn classify(query: &str) -> Classification {
        let tokens = tokenize(query);
        let joined = tokens.join(" ");

        let target_type = detect_target_type(&tokens);
        let framework_context = tokens.iter().any(|t| FRAMEWORK_NAMES.contains(&t.as_str()));
        let intent = detect_intent(&tokens, &joined, target_type, framework_context);
        let scope = detect_scope(&tokens);
        let keywords = extract_keywords(&tokens);

        Classification { intent, scope, target_type, framework_context, keywords }
    }
}

/// Lowercased tokens split on whitespace and punctuation; underscores
/// survive so snake_case identifiers stay whole.
pub fn tokenize(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_word(tokens: &[String], word: &str) -> bool {
    tokens.iter().any(|t| t == word)
}

fn has_phrase(joined: &str, phrase: &str) -> bool {
    joined == phrase
        || joined.starts_with(&format!("{phrase} "))
        || joined.ends_with(&format!(" {phrase}"))
        || joined.contains(&format!(" {phrase} "))
}

fn detect_intent(
    tokens: &[String],
    joined: &str,
    target_type: Option<UnitType>,
    framework_context: bool,
) -> Intent {
    // 1. locate
    if has_word(tokens, "where") || has_word(tokens, "find") || has_phrase(joined, "which file") {
        return Intent::Locate;
    }

    // 2. trace
    if has_word(tokens, "calls")
        || has_phrase(joined, "who calls")
        || has_phrase(joined, "depends on")
        || has_phrase(joined, "what depends")
        || (has_word(tokens, "trace") && has_word(tokens, "through"))
    {
        return Intent::Trace;
    }

    // 3. debug
    if has_word(tokens, "fix")
        || has_word(tokens, "bug")
        || has_word(tokens, "error")
        || has_word(tokens, "broken")
    {
        return Intent::Debug;
    }

    // 4. implement: a build verb plus a type noun
    if (has_word(tokens, "add") || has_word(tokens, "create") || has_word(tokens, "build"))
        && target_type.is_some()
    {
        return Intent::Implement;
    }

    // 5. framework: framework name plus a question word
    if framework_context
        && (has_word(tokens, "how") || has_word(tokens, "what") || has_word(tokens, "does"))
    {
        return Intent::Framework;
    }

    // 6. reference
    if has_word(tokens, "interface")
        || has_word(tokens, "api")
        || has_phrase(joined, "list all")
        || has_phrase(joined, "list available")
    {
        return Intent::Reference;
    }

    // 7. compare
    if has_word(tokens, "compare") || has_phrase(joined, "difference between") {
        return Intent::Compare;
    }

    Intent::Understand
}

fn detect_scope(tokens: &[String]) -> Scope {
    if has_word(tokens, "exactly")
        || has_word(tokens, "specific")
        || has_word(tokens, "just")
        || has_word(tokens, "only")
    {
        return Scope::Pinpoint;
    }
    if has_word(tokens, "all") || has_word(tokens, "every") || has_word(tokens, "entire") {
        return Scope::Comprehensive;
    }
    if has_word(tokens, "related") || has_word(tokens, "similar") || has_word(tokens, "associated")
    {
        return Scope::Exploratory;
    }
    Scope::Focused
}

fn detect_target_type(tokens: &[String]) -> Option<UnitType> {
    const MODEL: &[&str] = &["model", "models", "schema", "columns", "activerecord", "validation", "validations"];
    const CONTROLLER: &[&str] = &["controller", "controllers", "endpoint", "endpoints", "request", "action", "filter"];
    const SERVICE: &[&str] = &["service", "services", "interactor"];
    const JOB: &[&str] = &["job", "jobs", "worker", "workers", "sidekiq", "queue", "background"];
    const MAILER: &[&str] = &["mailer", "mailers", "email", "emails", "notification"];
    const GRAPHQL: &[&str] = &["graphql", "fields"];

    let hit = |set: &[&str]| tokens.iter().any(|t| set.contains(&t.as_str()));

    // Mutation / resolver nouns pick the precise GraphQL tag.
    if has_word(tokens, "mutation") || has_word(tokens, "mutations") {
        return Some(UnitType::GraphqlMutation);
    }
    if has_word(tokens, "resolver") || has_word(tokens, "resolvers") {
        return Some(UnitType::GraphqlResolver);
    }

    if hit(MODEL) {
        Some(UnitType::Model)
    } else if hit(CONTROLLER) {
        Some(UnitType::Controller)
    } else if hit(SERVICE) {
        Some(UnitType::Service)
    } else if hit(JOB) {
        Some(UnitType::Job)
    } else if hit(MAILER) {
        Some(UnitType::Mailer)
    } else if hit(GRAPHQL) {
        Some(UnitType::GraphqlType)
    } else {
        None
    }
}

fn extract_keywords(tokens: &[String]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut keywords = Vec::new();
    for token in tokens {
        if token.len() < 2 || STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            keywords.push(token.clone());
        }
    }
    keywords
}
