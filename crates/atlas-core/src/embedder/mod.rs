//! Embedding provider interface.
//!
//! Retrieval only depends on the narrow [`EmbeddingProvider`] contract:
//! text in, fixed-dimension unit vector out, with a batch entry point.
//! Two implementations ship here:
//!
//! 1. **`HashEmbedder`** -- deterministic token-bucket bag-of-words.
//!    No network, no model files. Similar texts share token buckets and
//!    therefore score high on cosine, which is exactly enough for
//!    offline deployments and deterministic tests.
//! 2. **`HttpEmbedder`** -- calls an OpenAI-compatible `/embeddings`
//!    endpoint. API keys come from the environment, never from config
//!    files.
//!
//! ## Failure handling
//!
//! HTTP 429 maps to a rate-limited embedding error so the indexer can
//! back off and retry; other failures are plain embedding errors. A
//! provider returning the wrong dimension is caught by the indexer and
//! treated as fatal.

use sha2::{Digest, Sha256};

use crate::error::{AtlasError, AtlasResult};

/// Maps text to a fixed-dimension unit vector; batch-capable.
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for traces and status output.
    fn name(&self) -> &str;

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, preserving order.
    fn embed_batch(&self, texts: &[&str]) -> AtlasResult<Vec<Vec<f32>>>;

    /// Embed one text.
    fn embed(&self, text: &str) -> AtlasResult<Vec<f32>> {
        let mut batch = self.embed_batch(&[text])?;
        batch
            .pop()
            .ok_or_else(|| AtlasError::Embedding {
                message: "provider returned an empty batch".into(),
                rate_limited: false,
            })
    }
}

// ---------------------------------------------------------------------------
// HashEmbedder
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embedder.
///
/// Each token hashes into one of `dimensions` buckets; the bucket
/// counts are L2-normalized. Texts sharing vocabulary land near each
/// other under cosine similarity, and identical text always produces
/// an identical vector.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Default dimensionality for the hash embedder.
    pub const DEFAULT_DIMENSIONS: usize = 256;

    /// An embedder with the given dimensionality (minimum 8).
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions: dimensions.max(8) }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let mut value = [0u8; 8];
        value.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(value) % self.dimensions as u64) as usize
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str]) -> AtlasResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dimensions];
                for token in text
                    .split(|c: char| !c.is_alphanumeric() && c != '_')
                    .filter(|t| !t.is_empty())
                {
                    vector[self.bucket(&token.to_lowercase())] += 1.0;
                }

                let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in &mut vector {
                        *v /= norm;
                    }
                }
                vector
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// HttpEmbedder
// ---------------------------------------------------------------------------

/// Which hosted embedding provider an [`HttpEmbedder`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProviderKind {
    /// OpenAI `/v1/embeddings`.
    OpenAi,
    /// Voyage AI `/v1/embeddings` (OpenAI-compatible body).
    Voyage,
    /// Cohere `/v2/embed` exposed through its compatibility endpoint.
    Cohere,
}

impl HttpProviderKind {
    /// Environment variable holding the API key.
    pub fn key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Voyage => "VOYAGE_API_KEY",
            Self::Cohere => "COHERE_API_KEY",
        }
    }

    /// Default endpoint URL.
    pub fn default_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1/embeddings",
            Self::Voyage => "https://api.voyageai.com/v1/embeddings",
            Self::Cohere => "https://api.cohere.com/compatibility/v1/embeddings",
        }
    }

    /// Parse a config string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "voyage" => Some(Self::Voyage),
            "cohere" => Some(Self::Cohere),
            _ => None,
        }
    }
}

/// Embedding provider over an OpenAI-compatible HTTP endpoint.
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    api_key: String,
    dimensions: usize,
    provider_name: String,
}

#[derive(serde::Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(serde::Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Build a provider for the given kind, reading the API key from
    /// its environment variable.
    pub fn from_env(kind: HttpProviderKind, model: &str, dimensions: usize) -> AtlasResult<Self> {
        let api_key = std::env::var(kind.key_env()).map_err(|_| AtlasError::Config {
            details: format!("{} is not set", kind.key_env()),
        })?;

        Ok(Self {
            client: reqwest::blocking::Client::new(),
            url: kind.default_url().to_string(),
            model: model.to_string(),
            api_key,
            dimensions,
            provider_name: format!("{kind:?}").to_lowercase(),
        })
    }

    /// Build against an explicit endpoint (local gateways, tests).
    pub fn with_url(url: &str, model: &str, api_key: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            url: url.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            dimensions,
            provider_name: "http".to_string(),
        }
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str]) -> AtlasResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest { model: &self.model, input: texts })
            .send()
            .map_err(|e| AtlasError::Embedding {
                message: format!("request failed: {e}"),
                rate_limited: false,
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AtlasError::Embedding {
                message: "provider throttled the batch (429)".into(),
                rate_limited: true,
            });
        }
        if !status.is_success() {
            return Err(AtlasError::Embedding {
                message: format!("provider returned {status}"),
                rate_limited: false,
            });
        }

        let body: EmbeddingResponse = response.json().map_err(|e| AtlasError::Embedding {
            message: format!("invalid response body: {e}"),
            rate_limited: false,
        })?;

        if body.data.len() != texts.len() {
            return Err(AtlasError::Embedding {
                message: format!(
                    "provider returned {} vectors for {} inputs",
                    body.data.len(),
                    texts.len()
                ),
                rate_limited: false,
            });
        }

        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}
