//! Reciprocal rank fusion over the lexical and vector candidate lists.
//!
//! Fusion operates on rank positions, not raw scores — BM25 and inner
//! product live on incomparable scales, and rank-based merging needs no
//! normalization step. Each candidate contributes `1 / (rank + c)` per
//! list it appears in (0-based rank, constant `c` defaults to 60 to
//! dampen rank-1 dominance); a candidate present in only one list still
//! participates with that single contribution.
//!
//! The output ordering is fully deterministic for identical inputs:
//! fused score descending, then document recency descending, then chunk
//! id ascending. Audit reproducibility depends on this.

use std::collections::HashMap;

use crate::index::IndexHit;
use crate::models::Candidate;

/// Default RRF dampening constant.
pub const DEFAULT_RRF_CONSTANT: f64 = 60.0;

/// Merge two ranked hit lists into one fused candidate ranking.
///
/// Inputs must already be ordered by descending relevance; only the
/// positions matter. Raw scores are carried through onto the candidate
/// for audit display, not used for ordering.
pub fn fuse(lexical: &[IndexHit], vector: &[IndexHit], constant: f64) -> Vec<Candidate> {
    let mut merged: HashMap<&str, Candidate> = HashMap::new();

    for (rank, hit) in lexical.iter().enumerate() {
        let entry = merged
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| blank_candidate(hit));
        entry.lexical_score = Some(hit.raw_score);
        entry.fused_score += rrf_contribution(rank, constant);
    }

    for (rank, hit) in vector.iter().enumerate() {
        let entry = merged
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| blank_candidate(hit));
        entry.vector_score = Some(hit.raw_score);
        entry.fused_score += rrf_contribution(rank, constant);
    }

    let mut candidates: Vec<Candidate> = merged.into_values().collect();
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates
}

fn rrf_contribution(rank: usize, constant: f64) -> f64 {
    1.0 / (rank as f64 + constant)
}

fn blank_candidate(hit: &IndexHit) -> Candidate {
    Candidate {
        chunk_id: hit.chunk_id.clone(),
        lexical_score: None,
        vector_score: None,
        fused_score: 0.0,
        rerank_score: None,
        updated_at: hit.updated_at,
    }
}
