//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete backends:
//! - **[`LocalProvider`]** — deterministic feature-hashing embedder; no
//!   network, stable across runs, good enough for lexical-adjacent
//!   semantic recall and for running the full pipeline offline.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's
//!   `/api/embed` endpoint.
//! - **[`OpenAiProvider`]** — calls the OpenAI embeddings API.
//! - **[`DisabledProvider`]** — always errors; used when embeddings are
//!   not configured.
//!
//! All vectors returned by [`EmbeddingProvider::embed`] are
//! L2-normalized before they leave this module, satisfying the vector
//! index's precondition.
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient errors with exponential backoff:
//! HTTP 429 and 5xx and network errors retry (1s, 2s, 4s, … capped at
//! 2^5); other 4xx fail immediately.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use sapcite_core::index::vector::l2_normalize;

use crate::config::EmbeddingConfig;

/// Trait for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one L2-normalized vector per input, in
    /// input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the provider selected by configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(LocalProvider::new(config.dims))),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        "disabled" => Ok(Box::new(DisabledProvider)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

// ============ Disabled Provider ============

/// A no-op provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ Local Provider ============

/// Deterministic feature-hashing embedder.
///
/// Token unigrams and bigrams are FNV-hashed into `dims` buckets with a
/// hash-derived sign, then the vector is L2-normalized. Identical text
/// always produces the identical vector, which makes retrieval results
/// reproducible in tests and air-gapped deployments.
pub struct LocalProvider {
    dims: usize,
}

impl LocalProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let tokens: Vec<String> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
            .map(|t| t.to_lowercase())
            .collect();
        for window in 1..=2usize {
            for gram in tokens.windows(window) {
                let mut h = FNV_OFFSET;
                for t in gram {
                    for b in t.as_bytes() {
                        h ^= *b as u64;
                        h = h.wrapping_mul(FNV_PRIME);
                    }
                    h ^= 0x2e;
                    h = h.wrapping_mul(FNV_PRIME);
                }
                let bucket = (h % self.dims as u64) as usize;
                let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
                vector[bucket] += sign;
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        "local-feature-hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Ollama Provider ============

/// Embedding provider backed by a local Ollama instance.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    endpoint: String,
    config: EmbeddingConfig,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            dims: config.dims,
            endpoint,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(&url, None, &body, &self.config).await?;

        let embeddings = json["embeddings"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Ollama response missing 'embeddings'"))?;
        let mut out = Vec::with_capacity(embeddings.len());
        for emb in embeddings {
            let mut vector: Vec<f32> = emb
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("Malformed embedding in Ollama response"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            l2_normalize(&mut vector);
            out.push(vector);
        }
        Ok(out)
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    config: EmbeddingConfig,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model,
            dims: config.dims,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            "https://api.openai.com/v1/embeddings",
            Some(&api_key),
            &body,
            &self.config,
        )
        .await?;

        let data = json["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("OpenAI response missing 'data'"))?;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let mut vector: Vec<f32> = item["embedding"]
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("Malformed embedding in OpenAI response"))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            l2_normalize(&mut vector);
            out.push(vector);
        }
        Ok(out)
    }
}

/// POST a JSON body with the shared retry/backoff policy.
async fn post_with_retry(
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    config: &EmbeddingConfig,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("API error {}: {}", status, body_text));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_provider_deterministic() {
        let provider = LocalProvider::new(64);
        let a = provider.embed(&["VA01 pricing error".to_string()]).await.unwrap();
        let b = provider.embed(&["VA01 pricing error".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_local_provider_normalized() {
        let provider = LocalProvider::new(64);
        let vectors = provider
            .embed(&["billing due list stuck".to_string()])
            .await
            .unwrap();
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_local_provider_similarity_ordering() {
        let provider = LocalProvider::new(256);
        let vectors = provider
            .embed(&[
                "VA01 pricing error in sales order".to_string(),
                "pricing error in sales order VA01 processing".to_string(),
                "material master accounting view maintenance".to_string(),
            ])
            .await
            .unwrap();
        let sim = |a: &[f32], b: &[f32]| -> f32 {
            a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
        };
        assert!(sim(&vectors[0], &vectors[1]) > sim(&vectors[0], &vectors[2]));
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let provider = DisabledProvider;
        assert!(provider.embed(&["text".to_string()]).await.is_err());
    }

    #[test]
    fn test_create_provider_unknown_rejected() {
        let mut config = EmbeddingConfig::default();
        config.provider = "quantum".to_string();
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn test_create_local_provider() {
        let config = EmbeddingConfig::default();
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "local-feature-hash");
        assert_eq!(provider.dims(), 256);
    }
}
