//! The dual-index layer: lexical (BM25) and vector (inner product).
//!
//! Both indexes store entries keyed by the same chunk identifier space
//! and are rebuilt from persisted chunk records; they are
//! eventually-consistent duplicates of the chunk store, not a shared
//! structure. Each index takes writes as one batch per document so
//! concurrent readers observe either the pre- or post-publish state,
//! never a partially indexed document.

pub mod lexical;
pub mod vector;

use serde::Serialize;

/// A scored hit returned by either index. `raw_score` is BM25 for the
/// lexical index and inner product (= cosine, vectors are normalized)
/// for the vector index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexHit {
    pub chunk_id: String,
    pub raw_score: f64,
    /// Parent document recency, carried for deterministic tie-breaks
    /// downstream.
    pub updated_at: i64,
}
