//! Vector similarity index over L2-normalized embeddings.
//!
//! Scoring is plain inner product, which equals cosine similarity in
//! `[-1, 1]` because every stored and query vector is required to be
//! L2-normalized. A non-normalized input is a caller error and is
//! rejected, not silently corrected.
//!
//! The actual nearest-neighbor work sits behind [`AnnBackend`] so an
//! external ANN library can be slotted in; the in-tree
//! [`BruteForceBackend`] scans all entries, which is exact and entirely
//! adequate at corpus sizes where reranking dominates latency anyway.
//!
//! Batch publication mirrors the lexical index: one write lock per
//! document, readers see pre- or post-publish state only.

use std::sync::RwLock;

use crate::errors::{Result, RetrievalError};
use crate::index::IndexHit;

/// Tolerance when checking that a vector has unit norm.
const NORM_TOLERANCE: f32 = 1e-3;

/// Pluggable nearest-neighbor backend. Implementations may assume all
/// vectors are L2-normalized; validation happens in [`VectorIndex`].
pub trait AnnBackend: Send + Sync {
    fn upsert(&mut self, chunk_id: &str, vector: Vec<f32>, updated_at: i64);
    fn remove(&mut self, chunk_id: &str);
    /// All entries scored against `query`, best first.
    fn search(&self, query: &[f32]) -> Vec<IndexHit>;
    fn len(&self) -> usize;
}

/// Exact brute-force scan backend.
#[derive(Default)]
pub struct BruteForceBackend {
    entries: Vec<(String, Vec<f32>, i64)>,
}

impl AnnBackend for BruteForceBackend {
    fn upsert(&mut self, chunk_id: &str, vector: Vec<f32>, updated_at: i64) {
        self.remove(chunk_id);
        self.entries.push((chunk_id.to_string(), vector, updated_at));
    }

    fn remove(&mut self, chunk_id: &str) {
        self.entries.retain(|(id, _, _)| id != chunk_id);
    }

    fn search(&self, query: &[f32]) -> Vec<IndexHit> {
        let mut hits: Vec<IndexHit> = self
            .entries
            .iter()
            .filter(|(_, v, _)| v.len() == query.len())
            .map(|(id, v, updated_at)| IndexHit {
                chunk_id: id.clone(),
                raw_score: inner_product(query, v),
                updated_at: *updated_at,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Vector index with normalization enforcement and batch publication.
pub struct VectorIndex {
    backend: RwLock<Box<dyn AnnBackend>>,
    dims: usize,
}

impl VectorIndex {
    /// Brute-force index for `dims`-dimensional vectors.
    pub fn new(dims: usize) -> Self {
        Self::with_backend(dims, Box::new(BruteForceBackend::default()))
    }

    pub fn with_backend(dims: usize, backend: Box<dyn AnnBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
            dims,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Insert or replace one chunk vector.
    pub fn upsert(&self, chunk_id: &str, vector: Vec<f32>, updated_at: i64) -> Result<()> {
        self.check_vector(&vector)?;
        self.backend
            .write()
            .unwrap()
            .upsert(chunk_id, vector, updated_at);
        Ok(())
    }

    /// Remove one chunk vector. Unknown ids are a no-op.
    pub fn remove(&self, chunk_id: &str) {
        self.backend.write().unwrap().remove(chunk_id);
    }

    /// Publish a document's vectors as one atomic batch, removing the
    /// listed stale ids under the same lock. The whole batch is
    /// validated before any entry is written.
    pub fn publish(&self, entries: &[(String, Vec<f32>, i64)], remove_ids: &[String]) -> Result<()> {
        for (_, vector, _) in entries {
            self.check_vector(vector)?;
        }
        let mut backend = self.backend.write().unwrap();
        for id in remove_ids {
            backend.remove(id);
        }
        for (id, vector, updated_at) in entries {
            backend.upsert(id, vector.clone(), *updated_at);
        }
        Ok(())
    }

    /// Rank stored vectors against `query` by inner product, best
    /// first. `k` larger than the index size returns all entries.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        self.check_vector(query)?;
        let mut hits = self.backend.read().unwrap().search(query);
        hits.truncate(k);
        Ok(hits)
    }

    pub fn len(&self) -> usize {
        self.backend.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dims {
            return Err(RetrievalError::validation(
                "vector",
                format!("expected {} dims, got {}", self.dims, vector.len()),
            ));
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(RetrievalError::validation(
                "vector",
                format!("not L2-normalized (norm = {norm:.4})"),
            ));
        }
        Ok(())
    }
}

fn inner_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x * y) as f64).sum()
}

/// Scale a vector to unit L2 norm. Zero vectors are returned unchanged
/// (they cannot be normalized and will be rejected by the index).
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
