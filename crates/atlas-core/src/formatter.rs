//! Output formatters.
//!
//! Pure functions from an [`AssembledContext`] to presentation bytes.
//! Exactly one format is selected by configuration -- never inferred
//! from the caller, because the tool transport does not expose the
//! calling agent's identity.
//!
//! A second, smaller layer ([`ToolRenderer`]) turns tool results into
//! text: a `render_default` fallback plus per-tool hooks, so each
//! renderer supplies only the methods it differs on.

use serde::{Deserialize, Serialize};

use crate::types::AssembledContext;

/// The configured presentation format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Markdown headings, fenced code, bullet sources.
    #[default]
    Markdown,
    /// XML-wrapped Markdown with token attributes; content escaped.
    Claude,
    /// Plain text with dividers and bracketed sources.
    Plain,
    /// Pretty JSON of the assembled context.
    Json,
}

impl OutputFormat {
    /// Parse a config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" => Some(Self::Markdown),
            "claude" => Some(Self::Claude),
            "plain" => Some(Self::Plain),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// The config string for this format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Claude => "claude",
            Self::Plain => "plain",
            Self::Json => "json",
        }
    }
}

/// Render an assembled context in the given format.
pub fn format_context(context: &AssembledContext, format: OutputFormat) -> String {
    match format {
        OutputFormat::Markdown => format_markdown(context),
        OutputFormat::Claude => format_claude(context),
        OutputFormat::Plain => format_plain(context),
        OutputFormat::Json => format_json(context),
    }
}

fn format_markdown(context: &AssembledContext) -> String {
    let mut out = String::new();
    out.push_str("# Retrieved Context\n\n");
    out.push_str(&format!(
        "*{} / {} tokens*\n\n",
        context.tokens_used, context.budget
    ));
    out.push_str(&context.text);
    if !context.text.ends_with('\n') {
        out.push('\n');
    }

    if !context.sources.is_empty() {
        out.push_str("\n## Sources\n\n");
        for source in &context.sources {
            out.push_str(&format!(
                "- **{}** ({}, score {:.4}) -- {}{}\n",
                source.identifier,
                source.unit_type,
                source.score,
                source.file_path,
                if source.truncated { " [truncated]" } else { "" },
            ));
        }
    }
    out
}

fn format_claude(context: &AssembledContext) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "<retrieved_context tokens_used=\"{}\" budget=\"{}\">\n",
        context.tokens_used, context.budget
    ));
    out.push_str("<content>\n");
    out.push_str(&xml_escape(&context.text));
    out.push_str("\n</content>\n");
    out.push_str("<sources>\n");
    for source in &context.sources {
        out.push_str(&format!(
            "<source identifier=\"{}\" type=\"{}\" score=\"{:.4}\" file_path=\"{}\" truncated=\"{}\"/>\n",
            xml_escape(&source.identifier),
            source.unit_type,
            source.score,
            xml_escape(&source.file_path),
            source.truncated,
        ));
    }
    out.push_str("</sources>\n");
    out.push_str("</retrieved_context>\n");
    out
}

fn format_plain(context: &AssembledContext) -> String {
    let divider = "=".repeat(60);
    let mut out = String::new();
    out.push_str(&divider);
    out.push('\n');
    out.push_str(&format!("Tokens: {}/{}\n", context.tokens_used, context.budget));
    out.push_str(&divider);
    out.push('\n');
    out.push_str(&context.text);
    if !context.text.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&divider);
    out.push('\n');
    for source in &context.sources {
        out.push_str(&format!(
            "[{} | {} | {:.4} | {}]\n",
            source.identifier, source.unit_type, source.score, source.file_path
        ));
    }
    out
}

fn format_json(context: &AssembledContext) -> String {
    serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string())
}

/// Escape XML-special characters.
fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tool-response rendering
// ---------------------------------------------------------------------------

/// Serializes a tool's domain result to response text.
///
/// `render` dispatches per-tool hints onto the hook methods; renderers
/// override only the hooks they differ on.
pub trait ToolRenderer: Send + Sync {
    /// Fallback rendering for any tool.
    fn render_default(&self, tool: &str, result: &serde_json::Value) -> String;

    /// Hook for the `lookup` tool.
    fn render_lookup(&self, result: &serde_json::Value) -> String {
        self.render_default("lookup", result)
    }

    /// Hook for the `search` tool.
    fn render_search(&self, result: &serde_json::Value) -> String {
        self.render_default("search", result)
    }

    /// Dispatch on the tool name.
    fn render(&self, tool: &str, result: &serde_json::Value) -> String {
        match tool {
            "lookup" => self.render_lookup(result),
            "search" => self.render_search(result),
            _ => self.render_default(tool, result),
        }
    }
}

/// Markdown renderer: headers for lookups, numbered hits for searches.
pub struct MarkdownRenderer;

impl ToolRenderer for MarkdownRenderer {
    fn render_default(&self, _tool: &str, result: &serde_json::Value) -> String {
        match result {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }

    fn render_lookup(&self, result: &serde_json::Value) -> String {
        let identifier = result.get("identifier").and_then(|v| v.as_str()).unwrap_or("?");
        let unit_type = result.get("type").and_then(|v| v.as_str()).unwrap_or("?");
        let file_path = result.get("file_path").and_then(|v| v.as_str()).unwrap_or("?");
        let mut out = format!("## {identifier} ({unit_type})\n**File**: {file_path}\n");
        if let Some(source) = result.get("source_code").and_then(|v| v.as_str()) {
            out.push_str(&format!("```ruby\n{source}\n```\n"));
        }
        out
    }

    fn render_search(&self, result: &serde_json::Value) -> String {
        let Some(hits) = result.get("results").and_then(|v| v.as_array()) else {
            return self.render_default("search", result);
        };
        let mut out = format!("Found {} results:\n\n", hits.len());
        for (i, hit) in hits.iter().enumerate() {
            out.push_str(&format!(
                "{}. **{}** ({}) -- {}\n",
                i + 1,
                hit.get("identifier").and_then(|v| v.as_str()).unwrap_or("?"),
                hit.get("type").and_then(|v| v.as_str()).unwrap_or("?"),
                hit.get("file_path").and_then(|v| v.as_str()).unwrap_or("?"),
            ));
        }
        out
    }
}

/// Plain renderer: the default only, no per-tool dressing.
pub struct PlainRenderer;

impl ToolRenderer for PlainRenderer {
    fn render_default(&self, _tool: &str, result: &serde_json::Value) -> String {
        match result {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }
}

/// JSON renderer: every result is its pretty JSON.
pub struct JsonRenderer;

impl ToolRenderer for JsonRenderer {
    fn render_default(&self, _tool: &str, result: &serde_json::Value) -> String {
        serde_json::to_string_pretty(result).unwrap_or_default()
    }
}

/// The renderer for a configured format.
pub fn renderer_for(format: OutputFormat) -> Box<dyn ToolRenderer> {
    match format {
        OutputFormat::Markdown | OutputFormat::Claude => Box::new(MarkdownRenderer),
        OutputFormat::Plain => Box::new(PlainRenderer),
        OutputFormat::Json => Box::new(JsonRenderer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Section, SourceRef, UnitType};

    fn sample_context() -> AssembledContext {
        AssembledContext {
            text: "## User (model)\napp/models/user.rb\n\nclass User < ApplicationRecord\nend\n".into(),
            tokens_used: 21,
            budget: 8000,
            sources: vec![SourceRef {
                identifier: "User".into(),
                unit_type: UnitType::Model,
                score: 0.91,
                file_path: "app/models/user.rb".into(),
                truncated: false,
            }],
            sections: vec![Section::Primary],
        }
    }

    #[test]
    fn test_markdown_has_sources_list() {
        let out = format_context(&sample_context(), OutputFormat::Markdown);
        assert!(out.starts_with("# Retrieved Context"));
        assert!(out.contains("## Sources"));
        assert!(out.contains("- **User** (model, score 0.9100)"));
    }

    #[test]
    fn test_claude_escapes_content() {
        let mut context = sample_context();
        context.text = "if a < b && c > d".into();
        let out = format_context(&context, OutputFormat::Claude);
        assert!(out.contains("tokens_used=\"21\""));
        assert!(out.contains("budget=\"8000\""));
        assert!(out.contains("a &lt; b &amp;&amp; c &gt; d"));
        assert!(!out.contains("a < b"));
    }

    #[test]
    fn test_plain_has_token_line_and_brackets() {
        let out = format_context(&sample_context(), OutputFormat::Plain);
        assert!(out.contains("Tokens: 21/8000"));
        assert!(out.contains("[User | model | 0.9100 | app/models/user.rb]"));
    }

    #[test]
    fn test_json_round_trips() {
        let context = sample_context();
        let out = format_context(&context, OutputFormat::Json);
        let parsed: AssembledContext = serde_json::from_str(&out).expect("parse");
        assert_eq!(parsed.tokens_used, context.tokens_used);
        assert_eq!(parsed.sections, context.sections);
        assert_eq!(parsed.sources.len(), context.sources.len());
        assert_eq!(parsed.sources[0].identifier, "User");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(OutputFormat::parse("claude"), Some(OutputFormat::Claude));
        assert_eq!(OutputFormat::parse("yaml"), None);
        for f in [OutputFormat::Markdown, OutputFormat::Claude, OutputFormat::Plain, OutputFormat::Json] {
            assert_eq!(OutputFormat::parse(f.as_str()), Some(f));
        }
    }

    #[test]
    fn test_renderer_dispatch() {
        let renderer = MarkdownRenderer;
        let lookup = serde_json::json!({
            "identifier": "User",
            "type": "model",
            "file_path": "app/models/user.rb",
            "source_code": "class User\nend",
        });
        let out = renderer.render("lookup", &lookup);
        assert!(out.starts_with("## User (model)"));
        assert!(out.contains("```ruby"));

        let search = serde_json::json!({
            "results": [
                {"identifier": "Post", "type": "model", "file_path": "app/models/post.rb"},
            ],
        });
        let out = renderer.render("search", &search);
        assert!(out.contains("Found 1 results"));
        assert!(out.contains("1. **Post**"));

        // Unknown tools fall back to the default.
        let out = renderer.render("structure", &serde_json::json!({"models": 3}));
        assert!(out.contains("\"models\": 3"));
    }

    #[test]
    fn test_plain_renderer_uses_default_everywhere() {
        let renderer = PlainRenderer;
        let out = renderer.render("lookup", &serde_json::json!({"identifier": "User"}));
        assert!(out.contains("\"identifier\": \"User\""));
    }
}
