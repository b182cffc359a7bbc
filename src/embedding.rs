//! Embedding generation: remote (OpenAI-compatible) or local via fastembed

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};

/// Why text is being embedded. Passed through to backends that
/// distinguish document and query embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    Add,
    Search,
}

impl EmbedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedMode::Add => "add",
            EmbedMode::Search => "search",
        }
    }
}

/// Batch text embedding capability
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text in one call; output order matches input order.
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>>;

    /// Length of every produced vector
    fn dimensions(&self) -> usize;

    /// Generate an embedding for a single text
    async fn embed_one(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()], mode)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("No embedding returned"))
    }
}

/// Embedding service for generating vector embeddings locally
pub struct LocalEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

impl LocalEmbedder {
    /// Create a new embedding service with local model
    pub fn new(config: &Config) -> Result<Self> {
        let (model_kind, dimensions) = match config.embedding_model.as_str() {
            "all-MiniLM-L6-v2" | "text-embedding-3-small" => (EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            "nomic-embed-text-v1.5" => (EmbeddingModel::NomicEmbedTextV15, 768),
            other => {
                return Err(Error::config(format!("Unsupported local embedding model: {}", other)))
            }
        };

        if config.embedding_dimensions != dimensions {
            tracing::warn!(
                configured = config.embedding_dimensions,
                model = dimensions,
                "Local model dimensions override configured dimensions"
            );
        }

        // Model downloads automatically on first use to ~/.cache/fastembed
        let model = TextEmbedding::try_new(
            InitOptions::new(model_kind).with_show_download_progress(true),
        )
        .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.model.lock().await;
        guard
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Token limit of OpenAI embedding models
const OPENAI_MAX_INPUT_TOKENS: usize = 8191;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    tokens: Option<TokenCounter>,
}

impl OpenAiEmbedder {
    pub fn new(config: &Config, api_key: Option<String>) -> Result<Self> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::config("OPENAI_API_KEY not found in environment or secrets"))?;

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        let tokens = match TokenCounter::cl100k() {
            Ok(counter) => Some(counter),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Token counter unavailable; inputs will not be truncated"
                );
                None
            }
        };

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.openai_base_url),
            api_key,
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
            tokens,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let input = match &self.tokens {
            Some(counter) => texts
                .iter()
                .map(|t| counter.truncate(t, OPENAI_MAX_INPUT_TOKENS))
                .collect(),
            None => texts.to_vec(),
        };

        tracing::debug!(count = texts.len(), mode = mode.as_str(), "Requesting embeddings");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input,
                dimensions: self.dimensions,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::embedding(format!("Embedding API returned {}: {}", status, body)));
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(Error::embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);

        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimensions) {
            return Err(Error::embedding(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                bad.len()
            )));
        }
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Token counter using tiktoken
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// cl100k_base, shared by the OpenAI embedding models
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| Error::config(format!("Failed to load cl100k_base: {}", e)))?;
        Ok(Self { bpe })
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Cut `text` down to at most `max_tokens` tokens
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        match self.bpe.decode(tokens[..max_tokens].to_vec()) {
            Ok(truncated) => truncated,
            // ~4 characters per token
            Err(_) => text.chars().take(max_tokens * 4).collect(),
        }
    }
}

/// Build the embedder selected by `config`
pub fn build_embedder(config: &Config, api_key: Option<String>) -> Result<Arc<dyn Embedder>> {
    use crate::config::EmbeddingProvider;

    Ok(match config.embedding_provider {
        EmbeddingProvider::OpenAi => Arc::new(OpenAiEmbedder::new(config, api_key)?),
        EmbeddingProvider::Local => Arc::new(LocalEmbedder::new(config)?),
    })
}
