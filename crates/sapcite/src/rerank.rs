//! Cross-encoder reranking with graceful degradation.
//!
//! The [`RerankProvider`] trait mirrors the embedding provider seam:
//! `score(query, passage)` returns a relevance score, and the concrete
//! backend is chosen by configuration. When the external cross-encoder
//! is unreachable or times out, the orchestrator keeps the fused order
//! unchanged — reranking never turns into a hard failure.
//!
//! Backends:
//! - **[`HttpCrossEncoder`]** — POSTs `{query, passage}` pairs to an
//!   external scoring endpoint.
//! - **[`OverlapScorer`]** — local fallback: smoothed token overlap
//!   between query and passage, cheap and deterministic.
//! - **[`DisabledReranker`]** — always errors, forcing the fused-order
//!   fallback.
//!
//! This module also owns the authority coverage check: when any
//! high-authority source (spec or runbook) survived policy filtering,
//! at least one must appear in the final top-K, otherwise the context
//! pack carries a coverage-gap flag. A gap is a flag, not an error.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use sapcite_core::models::{Candidate, Chunk};

use crate::config::RerankConfig;

/// Trait for cross-encoder scoring backends.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Relevance of `passage` to `query`; higher is better.
    async fn score(&self, query: &str, passage: &str) -> Result<f64>;
}

/// Instantiate the reranker selected by configuration.
pub fn create_rerank_provider(config: &RerankConfig) -> Result<Box<dyn RerankProvider>> {
    match config.provider.as_str() {
        "overlap" => Ok(Box::new(OverlapScorer)),
        "http" => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("rerank.endpoint required for http provider"))?;
            Ok(Box::new(HttpCrossEncoder {
                endpoint,
                timeout: Duration::from_secs(config.timeout_secs),
            }))
        }
        "disabled" => Ok(Box::new(DisabledReranker)),
        other => bail!("Unknown rerank provider: {}", other),
    }
}

/// Always-unavailable reranker.
pub struct DisabledReranker;

#[async_trait]
impl RerankProvider for DisabledReranker {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn score(&self, _query: &str, _passage: &str) -> Result<f64> {
        bail!("Rerank provider is disabled")
    }
}

/// External cross-encoder endpoint. Expects a JSON response of the
/// shape `{"score": <float>}`.
pub struct HttpCrossEncoder {
    endpoint: String,
    timeout: Duration,
}

#[async_trait]
impl RerankProvider for HttpCrossEncoder {
    fn name(&self) -> &str {
        "http-cross-encoder"
    }

    async fn score(&self, query: &str, passage: &str) -> Result<f64> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let response = client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query, "passage": passage }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("Rerank endpoint returned {}", response.status());
        }
        let json: serde_json::Value = response.json().await?;
        json["score"]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("Rerank response missing 'score'"))
    }
}

/// Local fallback scorer: query-term coverage of the passage with a
/// length smoothing term. Not a real cross-encoder, but monotone in
/// term overlap and fully deterministic.
pub struct OverlapScorer;

#[async_trait]
impl RerankProvider for OverlapScorer {
    fn name(&self) -> &str {
        "overlap"
    }

    async fn score(&self, query: &str, passage: &str) -> Result<f64> {
        Ok(overlap_score(query, passage))
    }
}

fn overlap_score(query: &str, passage: &str) -> f64 {
    let query_terms: Vec<String> = tokenize(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let passage_lower = passage.to_lowercase();
    let matched = query_terms
        .iter()
        .filter(|t| passage_lower.contains(t.as_str()))
        .count();
    let coverage = matched as f64 / query_terms.len() as f64;
    // Mild preference for tighter passages when coverage ties.
    let brevity = 1.0 / (1.0 + (passage.split_whitespace().count() as f64 / 400.0));
    coverage * 0.9 + coverage * brevity * 0.1
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| t.to_lowercase())
        .collect()
}

/// True when high-authority sources exist among the filtered
/// candidates but none made the final top-K.
pub fn has_coverage_gap<'a, F>(
    filtered: &[Candidate],
    final_top: &[Candidate],
    top_k: usize,
    mut lookup: F,
) -> bool
where
    F: FnMut(&str) -> Option<&'a Chunk>,
{
    let any_authority = filtered.iter().any(|c| {
        lookup(&c.chunk_id)
            .map(|chunk| chunk.meta.doc_type.is_high_authority())
            .unwrap_or(false)
    });
    if !any_authority {
        return false;
    }
    !final_top.iter().take(top_k).any(|c| {
        lookup(&c.chunk_id)
            .map(|chunk| chunk.meta.doc_type.is_high_authority())
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapcite_core::models::{Classification, ChunkType, DocumentType, InheritedMeta};
    use std::collections::{BTreeMap, BTreeSet};

    fn make_chunk(id: &str, doc_type: DocumentType) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: format!("doc-{id}"),
            chunk_index: 0,
            chunk_type: ChunkType::Paragraph,
            span_start: 0,
            span_end: 4,
            overlap_bytes: 0,
            text: "text".to_string(),
            token_count: 1,
            continuation: false,
            entities: BTreeMap::new(),
            meta: InheritedMeta {
                doc_type,
                release: "S4HANA_2023".to_string(),
                modules: BTreeSet::new(),
                classification: Classification::Internal,
                jurisdiction: None,
                updated_at: 0,
            },
            embedding: None,
            quality: 1.0,
            fingerprint: 0,
            stale: false,
        }
    }

    fn make_candidate(id: &str) -> Candidate {
        Candidate {
            chunk_id: id.to_string(),
            lexical_score: None,
            vector_score: None,
            fused_score: 0.5,
            rerank_score: None,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_overlap_scorer_prefers_matching_passage() {
        let scorer = OverlapScorer;
        let relevant = scorer
            .score("VA01 pricing error", "VA01 raises a pricing error during save")
            .await
            .unwrap();
        let unrelated = scorer
            .score("VA01 pricing error", "material master maintenance in MM01")
            .await
            .unwrap();
        assert!(relevant > unrelated);
    }

    #[tokio::test]
    async fn test_overlap_scorer_empty_query() {
        let scorer = OverlapScorer;
        assert_eq!(scorer.score("", "anything").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_disabled_reranker_errors() {
        let reranker = DisabledReranker;
        assert!(reranker.score("q", "p").await.is_err());
    }

    #[test]
    fn test_create_unknown_provider_rejected() {
        let mut config = RerankConfig::default();
        config.provider = "llm".to_string();
        assert!(create_rerank_provider(&config).is_err());
    }

    #[test]
    fn test_coverage_gap_detected() {
        let spec = make_chunk("spec", DocumentType::FunctionalSpec);
        let code_a = make_chunk("a", DocumentType::CodeObject);
        let code_b = make_chunk("b", DocumentType::CodeObject);
        let lookup = |id: &str| match id {
            "spec" => Some(&spec),
            "a" => Some(&code_a),
            "b" => Some(&code_b),
            _ => None,
        };
        let filtered = vec![make_candidate("a"), make_candidate("b"), make_candidate("spec")];
        let final_top = vec![make_candidate("a"), make_candidate("b")];
        assert!(has_coverage_gap(&filtered, &final_top, 2, lookup));
    }

    #[test]
    fn test_no_gap_when_authority_in_top() {
        let spec = make_chunk("spec", DocumentType::Runbook);
        let code = make_chunk("a", DocumentType::CodeObject);
        let lookup = |id: &str| match id {
            "spec" => Some(&spec),
            "a" => Some(&code),
            _ => None,
        };
        let filtered = vec![make_candidate("spec"), make_candidate("a")];
        let final_top = vec![make_candidate("spec"), make_candidate("a")];
        assert!(!has_coverage_gap(&filtered, &final_top, 2, lookup));
    }

    #[test]
    fn test_no_gap_without_authority_sources() {
        let code = make_chunk("a", DocumentType::CodeObject);
        let note = make_chunk("b", DocumentType::OssNote);
        let lookup = |id: &str| match id {
            "a" => Some(&code),
            "b" => Some(&note),
            _ => None,
        };
        let filtered = vec![make_candidate("a"), make_candidate("b")];
        let final_top = vec![make_candidate("a")];
        assert!(!has_coverage_gap(&filtered, &final_top, 1, lookup));
    }
}
