//! Core data models for the Sapcite retrieval pipeline.
//!
//! These types represent the documents, chunks, queries, and candidates
//! that flow through ingestion and retrieval. Documents are immutable
//! once ingested except for supersession links; chunks carry a copy of
//! the parent metadata taken at chunk-creation time so later document
//! edits cannot retroactively change what a query already matched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entities::EntityKind;

/// SHA-256 of a document body, hex-encoded. This is the dedup
/// identity: identical hash means identical canonical content.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format a Unix timestamp as ISO 8601 for display and audit records.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// The kind of source document, used for chunking strategy selection
/// and the reranker's authority coverage check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    CodeObject,
    FunctionalSpec,
    TechnicalSpec,
    OssNote,
    Runbook,
    CustomizingGuide,
}

impl DocumentType {
    /// Document types that count as high-authority sources for the
    /// coverage check after reranking.
    pub fn is_high_authority(&self) -> bool {
        matches!(
            self,
            DocumentType::FunctionalSpec | DocumentType::TechnicalSpec | DocumentType::Runbook
        )
    }
}

/// Data classification level. The ordering is load-bearing: a caller
/// entitlement dominates a chunk iff `entitlement >= classification`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    #[default]
    Internal,
    Confidential,
    Restricted,
}

/// A normalized document as accepted by the ingest operation.
///
/// The `content_hash` (SHA-256 of the body) is the dedup identity: two
/// documents with the same hash are one canonical version, newest wins.
/// `superseded_by` is a weak reference — lookup only, never ownership —
/// and chains are traversed with a cycle guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub doc_type: DocumentType,
    pub release: String,
    pub modules: BTreeSet<String>,
    pub language: String,
    pub classification: Classification,
    pub jurisdiction: Option<String>,
    pub content_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub superseded_by: Option<String>,
}

/// Structural kind of a chunk, derived from the splitting boundary
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Method,
    Paragraph,
    ProcedureStep,
    QaPair,
}

/// Metadata copied from the parent [`Document`] at chunk-creation time.
///
/// Deliberately a snapshot, not a join: policy and guardrail decisions
/// must be reproducible from the chunk alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InheritedMeta {
    pub doc_type: DocumentType,
    pub release: String,
    pub modules: BTreeSet<String>,
    pub classification: Classification,
    pub jurisdiction: Option<String>,
    pub updated_at: i64,
}

/// A chunk of a document's normalized text.
///
/// Owned by exactly one document; `chunk_index` is dense and 0-based.
/// Byte spans of a document's chunks cover the parent text contiguously
/// except for the configured overlap window, so the original text is
/// reconstructible from the ordered chunk sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_type: ChunkType,
    /// Byte offset span `[start, end)` within the parent content.
    pub span_start: usize,
    pub span_end: usize,
    /// Bytes at the start of this chunk that repeat the tail of the
    /// previous chunk (0 for the first chunk).
    pub overlap_bytes: usize,
    pub text: String,
    pub token_count: usize,
    /// True when a single code unit exceeded the hard cap and was split
    /// at statement boundaries.
    pub continuation: bool,
    pub entities: BTreeMap<EntityKind, BTreeSet<String>>,
    pub meta: InheritedMeta,
    /// L2-normalized embedding; `None` until the embedding provider has
    /// produced one (the chunk is still lexically searchable meanwhile).
    pub embedding: Option<Vec<f32>>,
    /// Quality score in `[0, 1]`; chunks below the configured floor are
    /// not indexed but their spans remain on record.
    pub quality: f64,
    /// Shingle fingerprint used for near-duplicate detection.
    pub fingerprint: u64,
    /// Set when a newer near-duplicate displaced this chunk. Stale
    /// chunks stay in the store but leave both indexes.
    pub stale: bool,
}

/// Why a produced span was kept or discarded. Recorded for every span,
/// including ones that never reach an index, so the chunk cover of a
/// document can always be audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanDisposition {
    Indexed,
    BelowQualityFloor,
}

/// Audit record of one byte span produced by the chunker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub document_id: String,
    pub span_start: usize,
    pub span_end: usize,
    pub disposition: SpanDisposition,
}

/// Who is asking. Currently informational (entitlements do the actual
/// gating) but recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    Developer,
    Functional,
    Support,
    #[default]
    Unspecified,
}

/// What a caller is allowed to see: the maximum classification level
/// plus optional module and jurisdiction scopes. An absent scope set
/// means "no restriction on that axis"; an empty set means "nothing".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub max_classification: Classification,
    pub modules: Option<BTreeSet<String>>,
    pub jurisdictions: Option<BTreeSet<String>>,
}

impl Entitlement {
    /// Entitlement that sees only internal material, any module.
    pub fn internal_only() -> Self {
        Self {
            max_classification: Classification::Internal,
            modules: None,
            jurisdictions: None,
        }
    }
}

/// Per-request query context. Created for one request, discarded after
/// the response; nothing here outlives the pipeline run.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub text: String,
    pub role: CallerRole,
    pub entitlement: Entitlement,
    pub query_entities: BTreeMap<EntityKind, BTreeSet<String>>,
    pub target_release: Option<String>,
}

/// A ranked retrieval candidate as it moves through fusion, policy,
/// and reranking. Scores are `None` until the corresponding stage has
/// produced them.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub lexical_score: Option<f64>,
    pub vector_score: Option<f64>,
    pub fused_score: f64,
    pub rerank_score: Option<f64>,
    /// Document recency, used for deterministic tie-breaking.
    pub updated_at: i64,
}

impl Candidate {
    /// The best available relevance signal: rerank score when present,
    /// fused score otherwise.
    pub fn relevance(&self) -> f64 {
        self.rerank_score.unwrap_or(self.fused_score)
    }
}

/// Flags attached to a context pack. These annotate — candidates are
/// never silently dropped on their account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackFlags {
    pub insufficient_evidence: bool,
    pub conflict_detected: bool,
    pub release_mismatch: bool,
    pub coverage_gap: bool,
}

/// One cited passage in a context pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub chunk: Chunk,
    pub citation: String,
    pub relevance: f64,
}

/// The final output of a query: ordered cited passages, guardrail
/// flags, and the abstention verdict. Constructed once per query and
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub response_id: String,
    pub passages: Vec<Passage>,
    pub flags: PackFlags,
    /// True when the guardrail verdict was `Insufficient` and the
    /// downstream generator must abstain instead of answering.
    pub abstained: bool,
}

/// On-disk shape of a chunk, mirroring [`Chunk`] exactly so both
/// indexes can be rebuilt from persisted records alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedChunkRecord {
    pub document: Document,
    pub chunk: Chunk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_ordering() {
        assert!(Classification::Internal < Classification::Confidential);
        assert!(Classification::Confidential < Classification::Restricted);
    }

    #[test]
    fn test_high_authority_types() {
        assert!(DocumentType::FunctionalSpec.is_high_authority());
        assert!(DocumentType::Runbook.is_high_authority());
        assert!(!DocumentType::CodeObject.is_high_authority());
        assert!(!DocumentType::OssNote.is_high_authority());
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("").len(), 64);
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_persisted_record_round_trips_json() {
        let chunk = Chunk {
            id: "d1:000".to_string(),
            document_id: "d1".to_string(),
            chunk_index: 0,
            chunk_type: ChunkType::Method,
            span_start: 0,
            span_end: 4,
            overlap_bytes: 0,
            text: "text".to_string(),
            token_count: 1,
            continuation: false,
            entities: BTreeMap::from([(
                EntityKind::Transaction,
                BTreeSet::from(["VA01".to_string()]),
            )]),
            meta: InheritedMeta {
                doc_type: DocumentType::CodeObject,
                release: "S4HANA_2023".to_string(),
                modules: BTreeSet::from(["SD".to_string()]),
                classification: Classification::Confidential,
                jurisdiction: Some("EU".to_string()),
                updated_at: 42,
            },
            embedding: Some(vec![0.6, 0.8]),
            quality: 0.9,
            fingerprint: 123,
            stale: false,
        };
        let record = PersistedChunkRecord {
            document: Document {
                id: "d1".to_string(),
                source_uri: "repo://d1".to_string(),
                doc_type: DocumentType::CodeObject,
                release: "S4HANA_2023".to_string(),
                modules: BTreeSet::from(["SD".to_string()]),
                language: "en".to_string(),
                classification: Classification::Confidential,
                jurisdiction: Some("EU".to_string()),
                content_hash: content_hash("text"),
                created_at: 42,
                updated_at: 42,
                superseded_by: None,
            },
            chunk,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: PersistedChunkRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunk.id, "d1:000");
        assert_eq!(back.chunk.embedding, Some(vec![0.6, 0.8]));
        assert_eq!(
            back.chunk.entities[&EntityKind::Transaction],
            BTreeSet::from(["VA01".to_string()])
        );
        assert_eq!(back.document.classification, Classification::Confidential);
    }

    #[test]
    fn test_candidate_relevance_prefers_rerank() {
        let mut c = Candidate {
            chunk_id: "c1".to_string(),
            lexical_score: Some(1.0),
            vector_score: None,
            fused_score: 0.2,
            rerank_score: None,
            updated_at: 0,
        };
        assert_eq!(c.relevance(), 0.2);
        c.rerank_score = Some(0.9);
        assert_eq!(c.relevance(), 0.9);
    }
}
