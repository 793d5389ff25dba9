//! Error types for atlas-core.
//!
//! Uses a hierarchical error enum so callers can pattern-match on
//! the subsystem that failed. Every variant also maps onto one of the
//! stable wire tags (`ErrorKind`) that tool responses carry, so callers
//! on the other side of the protocol can branch on category without
//! parsing messages.

use thiserror::Error;

/// Stable error categories carried on the wire as `error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Parameter or model/column validation failed.
    Validation,
    /// The requested tool is not registered.
    UnknownTool,
    /// The request frame could not be parsed.
    Parse,
    /// The operation is not supported by the active adapter.
    Unsupported,
    /// The handler exceeded its deadline.
    Timeout,
    /// A circuit breaker is open for the backing store.
    CircuitOpen,
    /// The backing store is unreachable or failing.
    StoreUnavailable,
    /// Embedding provider failure (including dimension mismatch).
    EmbeddingFailure,
    /// The operation is cooling down or the provider throttled us.
    RateLimited,
    /// A confirmation gate denied the operation.
    ConfirmationDenied,
    /// The SQL validator rejected the statement.
    SqlRejected,
    /// Handler execution failed for any other reason.
    Execution,
}

impl ErrorKind {
    /// The wire tag for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::UnknownTool => "unknown_tool",
            Self::Parse => "parse",
            Self::Unsupported => "unsupported",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::StoreUnavailable => "store_unavailable",
            Self::EmbeddingFailure => "embedding_failure",
            Self::RateLimited => "rate_limited",
            Self::ConfirmationDenied => "confirmation_denied",
            Self::SqlRejected => "sql_rejected",
            Self::Execution => "execution",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for all atlas-core operations.
#[derive(Debug, Error)]
pub enum AtlasError {
    // ---- Recoverable (operation failed, system healthy) ----
    /// Input validation failed. The message is safe to surface verbatim.
    #[error("{message}")]
    Validation {
        /// Human-readable description of what failed validation.
        message: String,
    },

    /// A requested unit or resource was not found.
    #[error("not found: {entity}")]
    NotFound {
        /// Description of what was not found.
        entity: String,
    },

    // ---- Degraded (system works with reduced capability) ----
    /// A store backend failed. Retrieval degrades to a lower tier.
    #[error("{backend} store error: {message}")]
    Store {
        /// Which store surface failed (vector, metadata, graph).
        backend: StoreBackend,
        /// Human-readable error description.
        message: String,
    },

    /// A circuit breaker is open; the call was short-circuited.
    #[error("circuit open for {backend}")]
    CircuitOpen {
        /// Name of the breaker that is open.
        backend: String,
    },

    /// The embedding provider failed for a batch or a single text.
    #[error("embedding failure: {message}")]
    Embedding {
        /// Human-readable error description.
        message: String,
        /// Whether the failure was a throttle (retry-eligible).
        rate_limited: bool,
    },

    /// The provider returned vectors of an unexpected dimension.
    /// Fatal for indexing: refuse to write and instruct a re-index.
    #[error(
        "embedding dimension mismatch: provider returned {got}, index expects {expected}; \
         run `codeatlas reindex` to rebuild the vector index"
    )]
    DimensionMismatch {
        /// Dimension the index was built with.
        expected: usize,
        /// Dimension the provider returned.
        got: usize,
    },

    /// The pipeline guard refused the operation (cooldown active).
    #[error("rate limited: {operation} ran {elapsed_secs}s ago (cooldown {cooldown_secs}s)")]
    RateLimited {
        /// Operation kind that was refused.
        operation: String,
        /// Seconds since the last run.
        elapsed_secs: u64,
        /// Configured cooldown in seconds.
        cooldown_secs: u64,
    },

    /// A confirmation gate denied the operation.
    #[error("confirmation denied for {tool}")]
    ConfirmationDenied {
        /// The tool that was denied.
        tool: String,
    },

    /// The SQL validator rejected a statement.
    #[error("Rejected: {reason}")]
    SqlRejected {
        /// Why the statement was rejected.
        reason: String,
    },

    /// A handler exceeded its deadline.
    #[error("timed out after {ms}ms")]
    Timeout {
        /// The deadline that was exceeded, in milliseconds.
        ms: u64,
    },

    /// The operation is not supported by the active adapter.
    #[error("unsupported: {operation}")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: String,
    },

    // ---- Fatal (system cannot operate) ----
    /// Configuration is invalid or missing required fields.
    #[error("configuration error: {details}")]
    Config {
        /// What's wrong with the config.
        details: String,
    },

    // ---- Wrapped external errors ----
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Which store surface raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreBackend {
    /// The vector store.
    Vector,
    /// The metadata store.
    Metadata,
    /// The graph store.
    Graph,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Vector => "vector",
            Self::Metadata => "metadata",
            Self::Graph => "graph",
        })
    }
}

impl AtlasError {
    /// The stable wire category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::NotFound { .. } => ErrorKind::Validation,
            Self::Store { .. } => ErrorKind::StoreUnavailable,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Embedding { rate_limited: true, .. } => ErrorKind::RateLimited,
            Self::Embedding { .. } | Self::DimensionMismatch { .. } => ErrorKind::EmbeddingFailure,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ConfirmationDenied { .. } => ErrorKind::ConfirmationDenied,
            Self::SqlRejected { .. } => ErrorKind::SqlRejected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Config { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Execution,
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Shorthand for a store error.
    pub fn store(backend: StoreBackend, message: impl Into<String>) -> Self {
        Self::Store { backend, message: message.into() }
    }
}

/// Convenience type alias for Results in atlas-core.
pub type AtlasResult<T> = Result<T, AtlasError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_map_to_stable_tags() {
        assert_eq!(AtlasError::validation("bad").kind().as_str(), "validation");
        assert_eq!(
            AtlasError::store(StoreBackend::Vector, "down").kind().as_str(),
            "store_unavailable"
        );
        assert_eq!(
            AtlasError::CircuitOpen { backend: "vector".into() }.kind().as_str(),
            "circuit_open"
        );
        assert_eq!(
            AtlasError::SqlRejected { reason: "nope".into() }.kind().as_str(),
            "sql_rejected"
        );
        assert_eq!(AtlasError::Timeout { ms: 100 }.kind().as_str(), "timeout");
    }

    #[test]
    fn test_rate_limited_embedding_maps_to_rate_limited() {
        let err = AtlasError::Embedding { message: "429".into(), rate_limited: true };
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let err = AtlasError::Embedding { message: "boom".into(), rate_limited: false };
        assert_eq!(err.kind(), ErrorKind::EmbeddingFailure);
    }

    #[test]
    fn test_dimension_mismatch_message_instructs_reindex() {
        let err = AtlasError::DimensionMismatch { expected: 768, got: 1024 };
        assert!(err.to_string().contains("reindex"));
        assert_eq!(err.kind(), ErrorKind::EmbeddingFailure);
    }
}
