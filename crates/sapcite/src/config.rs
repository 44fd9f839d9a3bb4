//! TOML configuration for the Sapcite pipeline.
//!
//! All tunables the pipeline exposes live here rather than as
//! hard-coded constants: chunking windows, candidate pool sizes, the
//! RRF constant, quality and relevance floors, rerank bounds, provider
//! endpoints, and cache capacity. `load_config` validates ranges up
//! front so a bad value fails at startup, not mid-query.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use sapcite_core::chunker::ChunkerConfig;
use sapcite_core::guardrail::GuardrailConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub guardrail: GuardrailSection,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// Directory holding persisted chunk records (and the audit log
    /// unless overridden).
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_hard_cap_tokens")]
    pub hard_cap_tokens: usize,
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
    #[serde(default = "default_quality_floor")]
    pub quality_floor: f64,
    #[serde(default = "default_near_dup_distance")]
    pub near_dup_distance: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            hard_cap_tokens: default_hard_cap_tokens(),
            overlap_fraction: default_overlap_fraction(),
            quality_floor: default_quality_floor(),
            near_dup_distance: default_near_dup_distance(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: self.max_tokens,
            hard_cap_tokens: self.hard_cap_tokens,
            overlap_fraction: self.overlap_fraction,
            quality_floor: self.quality_floor,
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_hard_cap_tokens() -> usize {
    800
}
fn default_overlap_fraction() -> f64 {
    0.12
}
fn default_quality_floor() -> f64 {
    0.15
}
fn default_near_dup_distance() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k_lexical: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k_lexical: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            final_limit: default_final_limit(),
            rerank_top_n: default_rerank_top_n(),
        }
    }
}

fn default_candidate_k() -> usize {
    80
}
fn default_final_limit() -> usize {
    12
}
fn default_rerank_top_n() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfig {
    /// RRF dampening constant; 60 keeps rank-1 hits from dominating.
    #[serde(default = "default_rrf_constant")]
    pub rrf_constant: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_constant: default_rrf_constant(),
        }
    }
}

fn default_rrf_constant() -> f64 {
    60.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailSection {
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,
    #[serde(default = "default_claim_window")]
    pub claim_window: usize,
    #[serde(default = "default_release_penalty")]
    pub release_penalty: f64,
}

impl Default for GuardrailSection {
    fn default() -> Self {
        Self {
            relevance_floor: default_relevance_floor(),
            claim_window: default_claim_window(),
            release_penalty: default_release_penalty(),
        }
    }
}

impl GuardrailSection {
    pub fn guardrail_config(&self) -> GuardrailConfig {
        GuardrailConfig {
            relevance_floor: self.relevance_floor,
            claim_window: self.claim_window,
            release_penalty: self.release_penalty,
        }
    }
}

fn default_relevance_floor() -> f64 {
    0.005
}
fn default_claim_window() -> usize {
    5
}
fn default_release_penalty() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `local`, `ollama`, `openai`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            endpoint: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `http` (external cross-encoder), `overlap` (local fallback
    /// scorer), or `disabled`.
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            endpoint: None,
            timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

fn default_rerank_provider() -> String {
    "overlap".to_string()
}
fn default_rerank_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Capacity of the query-embedding LRU cache.
    #[serde(default = "default_cache_capacity")]
    pub query_embedding_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_embedding_capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuditConfig {
    /// Path of the append-only JSONL audit log. Defaults to
    /// `<data.dir>/audit.jsonl`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.hard_cap_tokens < config.chunking.max_tokens {
        anyhow::bail!("chunking.hard_cap_tokens must be >= chunking.max_tokens");
    }
    if !(0.0..=0.5).contains(&config.chunking.overlap_fraction) {
        anyhow::bail!("chunking.overlap_fraction must be in [0.0, 0.5]");
    }
    if !(0.0..=1.0).contains(&config.chunking.quality_floor) {
        anyhow::bail!("chunking.quality_floor must be in [0.0, 1.0]");
    }
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.rerank_top_n < 1 {
        anyhow::bail!("retrieval.rerank_top_n must be >= 1");
    }
    if config.fusion.rrf_constant <= 0.0 {
        anyhow::bail!("fusion.rrf_constant must be > 0");
    }
    if !(0.0..=1.0).contains(&config.guardrail.release_penalty) {
        anyhow::bail!("guardrail.release_penalty must be in [0.0, 1.0]");
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" | "ollama" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, ollama, or openai.",
            other
        ),
    }
    match config.rerank.provider.as_str() {
        "disabled" | "overlap" | "http" => {}
        other => anyhow::bail!(
            "Unknown rerank provider: '{}'. Must be disabled, overlap, or http.",
            other
        ),
    }
    if config.rerank.provider == "http" && config.rerank.endpoint.is_none() {
        anyhow::bail!("rerank.endpoint required when rerank.provider is 'http'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[data]\ndir = \"/tmp/sapcite\"\n").unwrap();
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.hard_cap_tokens, 800);
        assert_eq!(config.retrieval.rerank_top_n, 50);
        assert_eq!(config.fusion.rrf_constant, 60.0);
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.rerank.provider, "overlap");
        assert_eq!(config.cache.query_embedding_capacity, 256);
    }

    #[test]
    fn test_overrides_applied() {
        let config = parse(
            r#"
[data]
dir = "/tmp/sapcite"

[chunking]
max_tokens = 300
hard_cap_tokens = 600

[fusion]
rrf_constant = 30.0

[retrieval]
rerank_top_n = 20
"#,
        )
        .unwrap();
        assert_eq!(config.chunking.max_tokens, 300);
        assert_eq!(config.fusion.rrf_constant, 30.0);
        assert_eq!(config.retrieval.rerank_top_n, 20);
    }

    #[test]
    fn test_invalid_cap_rejected() {
        let err = parse(
            "[data]\ndir = \"/tmp\"\n[chunking]\nmax_tokens = 500\nhard_cap_tokens = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("hard_cap_tokens"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err =
            parse("[data]\ndir = \"/tmp\"\n[embedding]\nprovider = \"quantum\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding provider"));
    }

    #[test]
    fn test_http_rerank_requires_endpoint() {
        let err = parse("[data]\ndir = \"/tmp\"\n[rerank]\nprovider = \"http\"\n").unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }
}
