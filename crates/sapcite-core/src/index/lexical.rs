//! In-memory inverted index with BM25 scoring.
//!
//! Terms are lowercased alphanumeric runs (underscores and hyphens kept
//! so ABAP identifiers like `ls_item-netwr` survive as typed). Scoring
//! uses the standard BM25 parameters `k1 = 1.2`, `b = 0.75`.
//!
//! Concurrency: all state lives behind one `RwLock`. Writers publish a
//! document's entries as a single batch under the write lock, so a
//! reader sees either none or all of a document's chunks — never a
//! partially written entry. Queries on an empty index return an empty
//! vec, never an error.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::index::IndexHit;
use crate::models::Chunk;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Default)]
struct Inner {
    /// term -> chunk id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    /// chunk id -> (token count, parent recency)
    docs: HashMap<String, (usize, i64)>,
    total_tokens: u64,
}

/// BM25 inverted index over chunk text.
pub struct LexicalIndex {
    inner: RwLock<Inner>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert or replace one chunk.
    pub fn upsert(&self, chunk: &Chunk) {
        let mut inner = self.inner.write().unwrap();
        remove_locked(&mut inner, &chunk.id);
        insert_locked(&mut inner, chunk);
    }

    /// Remove one chunk. Unknown ids are a no-op.
    pub fn remove(&self, chunk_id: &str) {
        let mut inner = self.inner.write().unwrap();
        remove_locked(&mut inner, chunk_id);
    }

    /// Publish a document's chunks as one atomic batch, removing the
    /// listed stale ids under the same lock.
    pub fn publish(&self, chunks: &[Chunk], remove_ids: &[String]) {
        let mut inner = self.inner.write().unwrap();
        for id in remove_ids {
            remove_locked(&mut inner, id);
        }
        for chunk in chunks {
            remove_locked(&mut inner, &chunk.id);
            insert_locked(&mut inner, chunk);
        }
    }

    /// Rank chunks for `text` by BM25, best first, at most `k` hits.
    pub fn query(&self, text: &str, k: usize) -> Vec<IndexHit> {
        let terms = tokenize(text);
        if terms.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap();
        let n = inner.docs.len();
        if n == 0 {
            return Vec::new();
        }
        let avgdl = inner.total_tokens as f64 / n as f64;

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in &terms {
            let Some(posting) = inner.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f64;
            let idf = (((n as f64 - df + 0.5) / (df + 0.5)) + 1.0).ln();
            for (chunk_id, tf) in posting {
                let (dl, _) = inner.docs[chunk_id.as_str()];
                let tf = *tf as f64;
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl as f64 / avgdl);
                *scores.entry(chunk_id.as_str()).or_insert(0.0) +=
                    idf * tf * (BM25_K1 + 1.0) / denom;
            }
        }

        let mut hits: Vec<IndexHit> = scores
            .into_iter()
            .map(|(chunk_id, score)| IndexHit {
                chunk_id: chunk_id.to_string(),
                raw_score: score,
                updated_at: inner.docs[chunk_id].1,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        hits
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_locked(inner: &mut Inner, chunk: &Chunk) {
    let terms = tokenize(&chunk.text);
    inner
        .docs
        .insert(chunk.id.clone(), (terms.len(), chunk.meta.updated_at));
    inner.total_tokens += terms.len() as u64;
    for term in terms {
        *inner
            .postings
            .entry(term)
            .or_default()
            .entry(chunk.id.clone())
            .or_insert(0) += 1;
    }
}

fn remove_locked(inner: &mut Inner, chunk_id: &str) {
    let Some((dl, _)) = inner.docs.remove(chunk_id) else {
        return;
    };
    inner.total_tokens = inner.total_tokens.saturating_sub(dl as u64);
    inner.postings.retain(|_, posting| {
        posting.remove(chunk_id);
        !posting.is_empty()
    });
}

/// Lowercased index terms. Hyphen and underscore stay inside tokens so
/// ABAP component paths and identifiers match as typed in queries.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| t.to_lowercase())
        .collect()
}
