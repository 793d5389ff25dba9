//! Configuration loading and validation.
//!
//! Configuration is resolved with the following precedence (highest wins):
//!
//! 1. CLI flags
//! 2. Environment variables (`CODEBASE_INDEX_DIR`, `CODEBASE_INDEX_CONFIG`)
//! 3. Index config (`<index-dir>/config.toml` unless overridden)
//! 4. User config (`~/.config/codeatlas/config.toml`)
//! 5. Compiled-in defaults
//!
//! Components never read this object directly at runtime; it exists to
//! seed their constructors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::embedder::{EmbeddingProvider, HashEmbedder, HttpEmbedder, HttpProviderKind};
use crate::error::{AtlasError, AtlasResult};
use crate::formatter::OutputFormat;

/// Environment variable naming the index directory.
pub const INDEX_DIR_ENV: &str = "CODEBASE_INDEX_DIR";
/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CODEBASE_INDEX_CONFIG";

/// Top-level configuration for CodeAtlas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Index directory holding unit files, manifests, and state.
    pub index_dir: PathBuf,

    /// Retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Output formatter selection.
    #[serde(default)]
    pub formatter: FormatterConfig,

    /// Embedding provider configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Storage backend selection.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pipeline guard configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Console (live-data) configuration.
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retrieval-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default token budget for context assembly.
    #[serde(default = "RetrievalConfig::default_token_budget")]
    pub token_budget: usize,

    /// Default candidate limit per strategy.
    #[serde(default = "RetrievalConfig::default_candidate_limit")]
    pub candidate_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            token_budget: Self::default_token_budget(),
            candidate_limit: Self::default_candidate_limit(),
        }
    }
}

impl RetrievalConfig {
    fn default_token_budget() -> usize { 8000 }
    fn default_candidate_limit() -> usize { 20 }
}

/// Formatter selection. Explicit configuration only; the transport does
/// not expose the caller's identity, so the format is never inferred.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatterConfig {
    /// One of `markdown`, `claude`, `plain`, `json`.
    #[serde(default)]
    pub format: OutputFormat,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider: `hash`, `openai`, `voyage`, or `cohere`.
    #[serde(default = "EmbeddingConfig::default_provider")]
    pub provider: String,

    /// Model name passed to hosted providers.
    #[serde(default = "EmbeddingConfig::default_model")]
    pub model: String,

    /// Output embedding dimensions.
    #[serde(default = "EmbeddingConfig::default_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            model: Self::default_model(),
            dimensions: Self::default_dimensions(),
        }
    }
}

impl EmbeddingConfig {
    fn default_provider() -> String { "hash".into() }
    fn default_model() -> String { "text-embedding-3-small".into() }
    fn default_dimensions() -> usize { HashEmbedder::DEFAULT_DIMENSIONS }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory` (file-seeded) or `sqlite`.
    #[serde(default = "StorageConfig::default_backend")]
    pub backend: String,

    /// SQLite database path; defaults to `<index-dir>/index.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: Self::default_backend(), db_path: None }
    }
}

impl StorageConfig {
    fn default_backend() -> String { "memory".into() }
}

/// Pipeline guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Cooldown between write-side operations, in seconds.
    #[serde(default = "PipelineConfig::default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { cooldown_secs: Self::default_cooldown_secs() }
    }
}

impl PipelineConfig {
    fn default_cooldown_secs() -> u64 { 60 }

    /// The cooldown as a duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Console (live-data server) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Application database the embedded adapter queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Audit log path; defaults to `<index-dir>/audit.jsonl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_path: Option<PathBuf>,

    /// Column names redacted from every returned record.
    #[serde(default = "ConsoleConfig::default_redacted_columns")]
    pub redacted_columns: Vec<String>,

    /// Confirmation mode: `auto_approve` or `auto_deny`.
    #[serde(default = "ConsoleConfig::default_confirmation")]
    pub confirmation: String,

    /// Statement timeout applied inside the safe context, in ms.
    #[serde(default = "ConsoleConfig::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            audit_log_path: None,
            redacted_columns: Self::default_redacted_columns(),
            confirmation: Self::default_confirmation(),
            statement_timeout_ms: Self::default_statement_timeout_ms(),
        }
    }
}

impl ConsoleConfig {
    fn default_redacted_columns() -> Vec<String> {
        vec![
            "encrypted_password".into(),
            "password_digest".into(),
            "reset_password_token".into(),
            "api_key".into(),
            "access_token".into(),
        ]
    }
    fn default_confirmation() -> String { "auto_deny".into() }
    fn default_statement_timeout_ms() -> u64 { 5000 }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug").
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Whether to output logs as JSON.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: Self::default_level(), json: false }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }
}

impl Config {
    /// Resolve configuration from flags, environment, and file.
    pub fn load(index_dir_flag: Option<&Path>, config_flag: Option<&Path>) -> AtlasResult<Self> {
        let index_dir = index_dir_flag
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(INDEX_DIR_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(".codeatlas"));

        let mut config = Self::defaults(&index_dir);

        // User config: ~/.config/codeatlas/config.toml
        if let Some(user_config_dir) = dirs::config_dir() {
            let user_config_path = user_config_dir.join("codeatlas").join("config.toml");
            if user_config_path.exists() {
                config.merge_from_file(&user_config_path)?;
            }
        }

        let config_path = config_flag
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| index_dir.join("config.toml"));

        if config_path.exists() {
            config.merge_from_file(&config_path)?;
        }

        Ok(config)
    }

    /// Compiled-in defaults for the given index directory.
    pub fn defaults(index_dir: &Path) -> Self {
        Self {
            index_dir: index_dir.to_path_buf(),
            retrieval: RetrievalConfig::default(),
            formatter: FormatterConfig::default(),
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            console: ConsoleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Merge values from a TOML file (non-destructive overlay).
    fn merge_from_file(&mut self, path: &Path) -> AtlasResult<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content).map_err(|e| AtlasError::Config {
            details: format!("invalid TOML in {}: {e}", path.display()),
        })?;

        if let Some(value) = overlay.get("retrieval") {
            if let Ok(parsed) = value.clone().try_into::<RetrievalConfig>() {
                self.retrieval = parsed;
            }
        }
        if let Some(value) = overlay.get("formatter") {
            if let Ok(parsed) = value.clone().try_into::<FormatterConfig>() {
                self.formatter = parsed;
            }
        }
        if let Some(value) = overlay.get("embedding") {
            if let Ok(parsed) = value.clone().try_into::<EmbeddingConfig>() {
                self.embedding = parsed;
            }
        }
        if let Some(value) = overlay.get("storage") {
            if let Ok(parsed) = value.clone().try_into::<StorageConfig>() {
                self.storage = parsed;
            }
        }
        if let Some(value) = overlay.get("pipeline") {
            if let Ok(parsed) = value.clone().try_into::<PipelineConfig>() {
                self.pipeline = parsed;
            }
        }
        if let Some(value) = overlay.get("console") {
            if let Ok(parsed) = value.clone().try_into::<ConsoleConfig>() {
                self.console = parsed;
            }
        }
        if let Some(value) = overlay.get("logging") {
            if let Ok(parsed) = value.clone().try_into::<LoggingConfig>() {
                self.logging = parsed;
            }
        }

        Ok(())
    }

    /// Construct the configured embedding provider.
    pub fn build_embedder(&self) -> AtlasResult<Arc<dyn EmbeddingProvider>> {
        match self.embedding.provider.as_str() {
            "hash" => Ok(Arc::new(HashEmbedder::new(self.embedding.dimensions))),
            other => match HttpProviderKind::parse(other) {
                Some(kind) => Ok(Arc::new(HttpEmbedder::from_env(
                    kind,
                    &self.embedding.model,
                    self.embedding.dimensions,
                )?)),
                None => Err(AtlasError::Config {
                    details: format!("unknown embedding provider: {other}"),
                }),
            },
        }
    }

    /// SQLite path for the embedded backend.
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| self.index_dir.join("index.db"))
    }

    /// Audit log path for the console server.
    pub fn audit_log_path(&self) -> PathBuf {
        self.console
            .audit_log_path
            .clone()
            .unwrap_or_else(|| self.index_dir.join("audit.jsonl"))
    }

    /// Feedback log path.
    pub fn feedback_log_path(&self) -> PathBuf {
        self.index_dir.join("feedback.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::defaults(Path::new("/tmp/idx"));
        assert_eq!(config.retrieval.token_budget, 8000);
        assert_eq!(config.retrieval.candidate_limit, 20);
        assert_eq!(config.pipeline.cooldown_secs, 60);
        assert_eq!(config.formatter.format, OutputFormat::Markdown);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.console.confirmation, "auto_deny");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/idx/index.db"));
        assert_eq!(config.audit_log_path(), PathBuf::from("/tmp/idx/audit.jsonl"));
    }

    #[test]
    fn test_merge_from_file_overrides_sections() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[retrieval]
token_budget = 4000

[formatter]
format = "claude"

[pipeline]
cooldown_secs = 10
"#,
        )
        .expect("write");

        let mut config = Config::defaults(dir.path());
        config.merge_from_file(&path).expect("merge");
        assert_eq!(config.retrieval.token_budget, 4000);
        assert_eq!(config.formatter.format, OutputFormat::Claude);
        assert_eq!(config.pipeline.cooldown_secs, 10);
        // Untouched sections keep their defaults.
        assert_eq!(config.embedding.provider, "hash");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [valid toml").expect("write");

        let mut config = Config::defaults(dir.path());
        let err = config.merge_from_file(&path).expect_err("invalid");
        assert!(matches!(err, AtlasError::Config { .. }));
    }

    #[test]
    fn test_build_embedder_hash() {
        let config = Config::defaults(Path::new("/tmp/idx"));
        let embedder = config.build_embedder().expect("build");
        assert_eq!(embedder.name(), "hash");
    }

    #[test]
    fn test_build_embedder_unknown_provider() {
        let mut config = Config::defaults(Path::new("/tmp/idx"));
        config.embedding.provider = "quantum".into();
        assert!(config.build_embedder().is_err());
    }
}
