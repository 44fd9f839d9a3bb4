//! The chunk store — the single source of truth both indexes mirror.
//!
//! Publication follows a staging-then-commit discipline: the caller
//! builds a document's complete chunk set first (chunking, entities,
//! embeddings), then commits it here under one write lock. Readers
//! always observe either the pre- or post-commit state of a document,
//! never half its chunks. The [`PublishOutcome`] tells the caller which
//! chunks to (re)index and which stale ids to drop from the indexes,
//! so the same batch boundary carries over to both index structures.
//!
//! Dedup and supersession semantics:
//! - Two documents with the same content hash are one canonical
//!   version; the newest wins, the older one is marked superseded.
//! - Near-duplicate chunks (shingle fingerprints within a configured
//!   Hamming distance) are deduplicated across documents; the chunk of
//!   the newest document stays indexed and the superseded one is
//!   flagged stale rather than deleted.
//! - Supersession links are weak references traversed with a
//!   bounded-depth cycle guard, since bad data entry can create loops.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::chunker::fingerprint_distance;
use crate::errors::{Result, RetrievalError};
use crate::models::{Chunk, ChunkSpan, Document, PersistedChunkRecord};

/// Hard cap on supersession chain traversal.
const SUPERSESSION_DEPTH_CAP: usize = 32;

/// What the indexes must do after a commit.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    /// Ids of all chunks created by this publish (stale ones included).
    pub chunk_ids: Vec<String>,
    /// Chunks to insert into both indexes.
    pub index: Vec<Chunk>,
    /// Chunk ids to remove from both indexes (replaced or gone stale).
    pub unindex: Vec<String>,
    /// True when the document was a duplicate of a newer canonical
    /// version and nothing changed.
    pub deduplicated: bool,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    by_hash: HashMap<String, String>,
    chunks: HashMap<String, Chunk>,
    doc_chunks: HashMap<String, Vec<String>>,
    spans: HashMap<String, Vec<ChunkSpan>>,
}

/// Thread-safe chunk store.
pub struct ChunkStore {
    inner: RwLock<Inner>,
    near_dup_distance: u32,
}

impl ChunkStore {
    pub fn new(near_dup_distance: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            near_dup_distance,
        }
    }

    /// Commit a fully staged document. `chunks` must be the complete
    /// ordered chunk set produced for `doc`.
    pub fn publish(
        &self,
        doc: Document,
        mut chunks: Vec<Chunk>,
        spans: Vec<ChunkSpan>,
    ) -> Result<PublishOutcome> {
        let mut inner = self.inner.write().unwrap();
        let mut outcome = PublishOutcome::default();

        // Content-hash dedup: same hash under a different id means the
        // same canonical document.
        if let Some(existing_id) = inner.by_hash.get(&doc.content_hash).cloned() {
            if existing_id != doc.id {
                let existing = inner.docs.get(&existing_id).cloned().ok_or_else(|| {
                    RetrievalError::validation("content_hash", "dangling dedup entry")
                })?;
                if existing.updated_at >= doc.updated_at {
                    // The stored version is canonical; re-ingest is a no-op.
                    outcome.deduplicated = true;
                    outcome.chunk_ids = inner
                        .doc_chunks
                        .get(&existing_id)
                        .cloned()
                        .unwrap_or_default();
                    return Ok(outcome);
                }
                // The incoming version is newer: the old document is
                // superseded and its chunks leave the indexes.
                if let Some(old) = inner.docs.get_mut(&existing_id) {
                    old.superseded_by = Some(doc.id.clone());
                }
                for chunk_id in inner
                    .doc_chunks
                    .get(&existing_id)
                    .cloned()
                    .unwrap_or_default()
                {
                    if let Some(chunk) = inner.chunks.get_mut(&chunk_id) {
                        if !chunk.stale {
                            chunk.stale = true;
                            outcome.unindex.push(chunk_id);
                        }
                    }
                }
            }
        }

        // Re-ingest under the same id replaces the previous chunk set.
        if let Some(old_ids) = inner.doc_chunks.remove(&doc.id) {
            for chunk_id in old_ids {
                if inner.chunks.remove(&chunk_id).is_some() {
                    outcome.unindex.push(chunk_id);
                }
            }
            let old_hash = inner.docs.get(&doc.id).map(|d| d.content_hash.clone());
            if let Some(hash) = old_hash {
                inner.by_hash.remove(&hash);
            }
        }

        // Near-duplicate pass against chunks of other documents.
        for chunk in chunks.iter_mut() {
            let mut displaced: Vec<String> = Vec::new();
            for (other_id, other) in inner.chunks.iter() {
                if other.stale || other.document_id == chunk.document_id {
                    continue;
                }
                if fingerprint_distance(chunk.fingerprint, other.fingerprint)
                    <= self.near_dup_distance
                {
                    if other.meta.updated_at > chunk.meta.updated_at {
                        // An existing chunk from a newer document wins.
                        chunk.stale = true;
                    } else {
                        displaced.push(other_id.clone());
                    }
                }
            }
            if !chunk.stale {
                for other_id in displaced {
                    if let Some(other) = inner.chunks.get_mut(&other_id) {
                        if !other.stale {
                            other.stale = true;
                            outcome.unindex.push(other_id);
                        }
                    }
                }
            }
        }

        // Commit.
        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        for chunk in &chunks {
            if !chunk.stale {
                outcome.index.push(chunk.clone());
            }
            inner.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        inner.doc_chunks.insert(doc.id.clone(), chunk_ids.clone());
        inner.spans.insert(doc.id.clone(), spans);
        inner.by_hash.insert(doc.content_hash.clone(), doc.id.clone());
        inner.docs.insert(doc.id.clone(), doc);

        outcome.chunk_ids = chunk_ids;
        Ok(outcome)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Option<Chunk> {
        self.inner.read().unwrap().chunks.get(chunk_id).cloned()
    }

    pub fn get_document(&self, doc_id: &str) -> Option<Document> {
        self.inner.read().unwrap().docs.get(doc_id).cloned()
    }

    /// Recorded spans for a document, including discarded ones.
    pub fn get_spans(&self, doc_id: &str) -> Vec<ChunkSpan> {
        self.inner
            .read()
            .unwrap()
            .spans
            .get(doc_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ordered non-stale chunk ids of a document.
    pub fn indexed_chunk_ids(&self, doc_id: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .doc_chunks
            .get(doc_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| inner.chunks.get(*id).map(|c| !c.stale).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Follow the supersession chain from `doc_id` to the newest
    /// version. Traversal is depth-capped and cycle-guarded: data entry
    /// errors must not hang the pipeline.
    pub fn resolve_canonical(&self, doc_id: &str) -> Option<Document> {
        let inner = self.inner.read().unwrap();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = inner.docs.get(doc_id)?;
        for _ in 0..SUPERSESSION_DEPTH_CAP {
            match &current.superseded_by {
                Some(next_id) if !visited.contains(next_id.as_str()) => {
                    visited.insert(&current.id);
                    match inner.docs.get(next_id) {
                        Some(next) => current = next,
                        None => break,
                    }
                }
                _ => break,
            }
        }
        Some(current.clone())
    }

    pub fn document_count(&self) -> usize {
        self.inner.read().unwrap().docs.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.read().unwrap().chunks.len()
    }

    /// Export every chunk with its parent document, in deterministic
    /// order. The records carry everything the indexes need, so a
    /// rebuild requires nothing else.
    pub fn export_records(&self) -> Vec<PersistedChunkRecord> {
        let inner = self.inner.read().unwrap();
        let mut doc_ids: Vec<&String> = inner.docs.keys().collect();
        doc_ids.sort();
        let mut records = Vec::new();
        for doc_id in doc_ids {
            let doc = &inner.docs[doc_id];
            if let Some(chunk_ids) = inner.doc_chunks.get(doc_id) {
                for chunk_id in chunk_ids {
                    if let Some(chunk) = inner.chunks.get(chunk_id) {
                        records.push(PersistedChunkRecord {
                            document: doc.clone(),
                            chunk: chunk.clone(),
                        });
                    }
                }
            }
        }
        records
    }

    /// Rebuild the store from persisted records. Returns the non-stale
    /// chunks, ready to feed both index rebuilds.
    pub fn import_records(&self, records: Vec<PersistedChunkRecord>) -> Vec<Chunk> {
        let mut inner = self.inner.write().unwrap();
        *inner = Inner::default();
        let mut indexable = Vec::new();
        for record in records {
            let doc = record.document;
            let chunk = record.chunk;
            inner.by_hash.insert(doc.content_hash.clone(), doc.id.clone());
            inner.docs.entry(doc.id.clone()).or_insert(doc);
            inner
                .doc_chunks
                .entry(chunk.document_id.clone())
                .or_default()
                .push(chunk.id.clone());
            if !chunk.stale {
                indexable.push(chunk.clone());
            }
            inner.chunks.insert(chunk.id.clone(), chunk);
        }
        indexable
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new(3)
    }
}
