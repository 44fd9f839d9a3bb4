//! Retrieval orchestrator: composes chunking, indexing, fusion, policy,
//! reranking, and guardrails into the ingest and query pipelines.
//!
//! # Ingest
//!
//! Validation → per-document-id serialization → chunk + entity
//! extraction → inline embedding (non-fatal; unembedded chunks stay
//! lexically searchable) → staged publish to the store and both indexes
//! as one batch. Ingestion failures are per-document: one bad document
//! never blocks or corrupts others.
//!
//! # Query
//!
//! Query embedding (LRU-cached, timeout-guarded) → lexical + vector
//! candidate fetch → reciprocal rank fusion → policy pre-filter →
//! bounded reranking with timeout and fused-order fallback → policy
//! re-filter → authority coverage check → guardrail evaluation →
//! immutable context pack with citations, plus one audit record naming
//! the candidates at every stage.
//!
//! The two external suspension points (embedding, reranking) both
//! degrade on timeout: reranking falls back to the fused order; a
//! missing query embedding aborts with an `INSUFFICIENT` abstention
//! rather than guessing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use sapcite_core::chunker::Chunker;
use sapcite_core::entities::EntityExtractor;
use sapcite_core::errors::{Result, RetrievalError};
use sapcite_core::fusion;
use sapcite_core::guardrail::{GuardrailEngine, Verdict};
use sapcite_core::index::lexical::LexicalIndex;
use sapcite_core::index::vector::VectorIndex;
use sapcite_core::models::{
    content_hash, format_ts_iso, CallerRole, Candidate, Chunk, Classification, ContextPack,
    Document, DocumentType, Entitlement, PackFlags, Passage, PersistedChunkRecord, QueryContext,
};
use sapcite_core::policy;
use sapcite_core::store::ChunkStore;

use crate::audit::{AuditRecord, AuditSink, JsonlAuditSink};
use crate::cache::EmbeddingCache;
use crate::config::Config;
use crate::embedding::{create_provider, embed_query, EmbeddingProvider};
use crate::rerank::{create_rerank_provider, has_coverage_gap, RerankProvider};

/// A normalized document as handed to the ingest operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub id: String,
    pub source_uri: String,
    pub doc_type: DocumentType,
    pub release: String,
    #[serde(default)]
    pub modules: std::collections::BTreeSet<String>,
    pub language: String,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    pub body: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub superseded_by: Option<String>,
}

/// Per-document ingest summary.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_ids: Vec<String>,
    pub chunks_indexed: usize,
    pub embeddings_written: usize,
    pub embeddings_pending: usize,
    pub deduplicated: bool,
}

/// One retrieval request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub role: CallerRole,
    pub entitlement: Entitlement,
    pub target_release: Option<String>,
    pub limit: Option<usize>,
}

/// The retrieval pipeline with its owned stores, indexes, providers,
/// and query-embedding cache.
pub struct Orchestrator {
    config: Config,
    store: ChunkStore,
    lexical: LexicalIndex,
    vector: VectorIndex,
    chunker: Chunker,
    extractor: EntityExtractor,
    guardrail: GuardrailEngine,
    embedder: Box<dyn EmbeddingProvider>,
    reranker: Box<dyn RerankProvider>,
    audit: Box<dyn AuditSink>,
    cache: Mutex<EmbeddingCache>,
    ingest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    /// Build the pipeline from configuration, instantiating providers
    /// and the JSONL audit sink.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let reranker = create_rerank_provider(&config.rerank)?;
        let audit_path = config
            .audit
            .path
            .clone()
            .unwrap_or_else(|| config.data.dir.join("audit.jsonl"));
        let audit: Box<dyn AuditSink> = Box::new(JsonlAuditSink::new(audit_path));
        Ok(Self::with_providers(config, embedder, reranker, audit))
    }

    /// Build the pipeline with explicit providers (used by tests and
    /// embedding callers).
    pub fn with_providers(
        config: Config,
        embedder: Box<dyn EmbeddingProvider>,
        reranker: Box<dyn RerankProvider>,
        audit: Box<dyn AuditSink>,
    ) -> Self {
        let store = ChunkStore::new(config.chunking.near_dup_distance);
        let lexical = LexicalIndex::new();
        let vector = VectorIndex::new(config.embedding.dims);
        let chunker = Chunker::new(config.chunking.chunker_config());
        let guardrail = GuardrailEngine::new(config.guardrail.guardrail_config());
        let cache = Mutex::new(EmbeddingCache::new(config.cache.query_embedding_capacity));
        Self {
            config,
            store,
            lexical,
            vector,
            chunker,
            extractor: EntityExtractor::new(),
            guardrail,
            embedder,
            reranker,
            audit,
            cache,
            ingest_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    // ============ Ingest pipeline ============

    /// Ingest one normalized document: validate, chunk, embed, and
    /// publish as a single batch. Concurrent ingests of the same
    /// document id are serialized; distinct ids proceed independently.
    pub async fn ingest(&self, input: DocumentInput) -> Result<IngestReport> {
        validate_input(&input)?;

        let id_lock = {
            let mut locks = self.ingest_locks.lock().await;
            locks
                .entry(input.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = id_lock.lock().await;

        let now = chrono::Utc::now().timestamp();
        let doc = Document {
            id: input.id.clone(),
            source_uri: input.source_uri.clone(),
            doc_type: input.doc_type,
            release: input.release.clone(),
            modules: input.modules.clone(),
            language: input.language.clone(),
            classification: input.classification,
            jurisdiction: input.jurisdiction.clone(),
            content_hash: content_hash(&input.body),
            created_at: input.created_at.unwrap_or(now),
            updated_at: input.updated_at.unwrap_or(now),
            superseded_by: input.superseded_by.clone(),
        };

        // Stage: build the complete chunk set before anything commits.
        let (mut chunks, spans) = self.chunker.chunk_document(&doc, &input.body, &self.extractor);

        // Inline embedding. Failure is non-fatal: the chunks stay
        // lexically searchable and are reported as pending.
        let mut embeddings_written = 0usize;
        let mut embeddings_pending = 0usize;
        if self.config.embedding.is_enabled() && !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let timeout = Duration::from_secs(self.config.embedding.timeout_secs);
            match tokio::time::timeout(timeout, self.embedder.embed(&texts)).await {
                Ok(Ok(vectors)) if vectors.len() == chunks.len() => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.embedding = Some(vector);
                        embeddings_written += 1;
                    }
                }
                _ => embeddings_pending = chunks.len(),
            }
        }

        // Commit: store first, then both indexes, each as one batch.
        let outcome = self.store.publish(doc, chunks, spans)?;
        if outcome.deduplicated {
            return Ok(IngestReport {
                document_id: input.id,
                chunk_ids: outcome.chunk_ids,
                chunks_indexed: 0,
                embeddings_written: 0,
                embeddings_pending: 0,
                deduplicated: true,
            });
        }

        self.lexical.publish(&outcome.index, &outcome.unindex);
        let vector_entries: Vec<(String, Vec<f32>, i64)> = outcome
            .index
            .iter()
            .filter_map(|chunk| {
                chunk
                    .embedding
                    .as_ref()
                    .map(|v| (chunk.id.clone(), v.clone(), chunk.meta.updated_at))
            })
            .collect();
        self.vector.publish(&vector_entries, &outcome.unindex)?;

        Ok(IngestReport {
            document_id: input.id,
            chunks_indexed: outcome.index.len(),
            chunk_ids: outcome.chunk_ids,
            embeddings_written,
            embeddings_pending,
            deduplicated: false,
        })
    }

    // ============ Query pipeline ============

    /// Run one retrieval request and assemble the context pack.
    pub async fn query(&self, request: QueryRequest) -> Result<ContextPack> {
        if request.text.trim().is_empty() {
            return Err(RetrievalError::validation("query", "must not be empty"));
        }
        if !self.config.embedding.is_enabled() {
            // A statically absent embedding backend means retrieval
            // cannot run at all, which is the one unrecoverable case.
            return Err(RetrievalError::provider(
                "embedding",
                "provider is disabled; query embeddings are impossible",
            ));
        }

        let context = QueryContext {
            text: request.text.clone(),
            role: request.role,
            entitlement: request.entitlement.clone(),
            query_entities: self.extractor.extract(&request.text),
            target_release: request.target_release.clone(),
        };
        let final_limit = request
            .limit
            .unwrap_or(self.config.retrieval.final_limit)
            .max(1);

        // Query embedding: cache first, then the provider under a
        // timeout. No fresh embedding means abstention, not a guess.
        let query_vec = match self.query_embedding(&context.text).await {
            Some(vector) => vector,
            None => {
                let pack = abstention_pack();
                self.emit_audit(&context, &[], &[], &[], Verdict::Insufficient, &pack.flags, &pack.response_id);
                return Ok(pack);
            }
        };

        // Candidate fetch from both indexes.
        let lexical_hits = self
            .lexical
            .query(&context.text, self.config.retrieval.candidate_k_lexical);
        let vector_hits = self
            .vector
            .query(&query_vec, self.config.retrieval.candidate_k_vector)?;

        // Reciprocal rank fusion.
        let fused = fusion::fuse(&lexical_hits, &vector_hits, self.config.fusion.rrf_constant);
        let pre_filter_ids: Vec<String> = fused.iter().map(|c| c.chunk_id.clone()).collect();

        // Policy pre-filter before the expensive stage.
        let filtered = self.policy_filter(fused, &context.entitlement);
        let post_policy_ids: Vec<String> = filtered.iter().map(|c| c.chunk_id.clone()).collect();

        // Bounded reranking with fused-order fallback.
        let mut reranked = filtered.clone();
        reranked.truncate(self.config.retrieval.rerank_top_n);
        let reranked = self.rerank_candidates(&context.text, reranked).await;

        // Policy re-filter: defense in depth against metadata changes
        // between the stages.
        let mut confirmed = self.policy_filter(reranked, &context.entitlement);
        confirmed.truncate(final_limit);

        // Guardrail evaluation annotates and may downrank. Chunks are
        // resolved once so the engine sees a consistent snapshot.
        let chunk_map: HashMap<String, Chunk> = confirmed
            .iter()
            .filter_map(|c| self.store.get_chunk(&c.chunk_id).map(|ch| (c.chunk_id.clone(), ch)))
            .collect();
        let outcome = self.guardrail.evaluate(
            &confirmed,
            context.target_release.as_deref(),
            |id| chunk_map.get(id),
        );

        // Authority coverage check over the final ordering.
        let filtered_chunks: HashMap<String, Chunk> = filtered
            .iter()
            .filter_map(|c| self.store.get_chunk(&c.chunk_id).map(|ch| (c.chunk_id.clone(), ch)))
            .collect();
        let final_order: Vec<Candidate> = outcome
            .ordered
            .iter()
            .map(|s| s.candidate.clone())
            .collect();
        let coverage_gap = has_coverage_gap(&filtered, &final_order, final_limit, |id| {
            filtered_chunks.get(id)
        });

        let mut flags = outcome.flags.clone();
        flags.coverage_gap = coverage_gap;
        let abstained = outcome.verdict == Verdict::Insufficient;

        // Assemble the immutable pack with citations.
        let response_id = Uuid::new_v4().to_string();
        let passages: Vec<Passage> = outcome
            .ordered
            .iter()
            .enumerate()
            .filter_map(|(i, scored)| {
                chunk_map.get(&scored.candidate.chunk_id).map(|chunk| Passage {
                    chunk: chunk.clone(),
                    citation: format!("S{}", i + 1),
                    relevance: scored.relevance,
                })
            })
            .collect();

        let post_rerank_ids: Vec<String> =
            passages.iter().map(|p| p.chunk.id.clone()).collect();
        let pack = ContextPack {
            response_id: response_id.clone(),
            passages,
            flags: flags.clone(),
            abstained,
        };

        self.emit_audit(
            &context,
            &pre_filter_ids,
            &post_policy_ids,
            &post_rerank_ids,
            outcome.verdict,
            &flags,
            &response_id,
        );
        Ok(pack)
    }

    /// Cached query embedding; `None` when no fresh embedding could be
    /// produced inside the timeout.
    async fn query_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let model = self.embedder.model_name().to_string();
        {
            let mut cache = self.cache.lock().await;
            if let Some(vector) = cache.get(&model, text) {
                return Some(vector);
            }
        }
        let timeout = Duration::from_secs(self.config.embedding.timeout_secs);
        match tokio::time::timeout(timeout, embed_query(self.embedder.as_ref(), text)).await {
            Ok(Ok(vector)) => {
                let mut cache = self.cache.lock().await;
                cache.put(&model, text, vector.clone());
                Some(vector)
            }
            _ => None,
        }
    }

    fn policy_filter(&self, candidates: Vec<Candidate>, entitlement: &Entitlement) -> Vec<Candidate> {
        let chunk_map: HashMap<String, Chunk> = candidates
            .iter()
            .filter_map(|c| self.store.get_chunk(&c.chunk_id).map(|ch| (c.chunk_id.clone(), ch)))
            .collect();
        policy::filter(candidates, entitlement, |id| {
            chunk_map.get(id).filter(|chunk| !chunk.stale)
        })
    }

    /// Score candidates with the cross-encoder under one overall
    /// timeout. Any failure keeps the fused order unchanged.
    async fn rerank_candidates(&self, query: &str, candidates: Vec<Candidate>) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }
        let timeout = Duration::from_secs(self.config.rerank.timeout_secs);
        let scored = tokio::time::timeout(timeout, async {
            let mut scored = Vec::with_capacity(candidates.len());
            for candidate in &candidates {
                let Some(chunk) = self.store.get_chunk(&candidate.chunk_id) else {
                    return Err(anyhow::anyhow!("chunk vanished during rerank"));
                };
                let score = self.reranker.score(query, &chunk.text).await?;
                scored.push(score);
            }
            Ok::<Vec<f64>, anyhow::Error>(scored)
        })
        .await;

        match scored {
            Ok(Ok(scores)) => {
                let mut reranked: Vec<Candidate> = candidates
                    .into_iter()
                    .zip(scores)
                    .map(|(mut candidate, score)| {
                        candidate.rerank_score = Some(score);
                        candidate
                    })
                    .collect();
                reranked.sort_by(|a, b| {
                    b.relevance()
                        .partial_cmp(&a.relevance())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.updated_at.cmp(&a.updated_at))
                        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
                });
                reranked
            }
            // Timeout or scorer failure: graceful degradation to the
            // fused order.
            _ => candidates,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_audit(
        &self,
        context: &QueryContext,
        pre_filter: &[String],
        post_policy: &[String],
        post_rerank: &[String],
        verdict: Verdict,
        flags: &PackFlags,
        response_id: &str,
    ) {
        let record = AuditRecord {
            response_id: response_id.to_string(),
            timestamp: format_ts_iso(chrono::Utc::now().timestamp()),
            query: context.text.clone(),
            query_entities: context.query_entities.clone(),
            entitlement: context.entitlement.clone(),
            pre_filter: pre_filter.to_vec(),
            post_policy: post_policy.to_vec(),
            post_rerank: post_rerank.to_vec(),
            verdict,
            flags: flags.clone(),
        };
        // Audit is best-effort at this layer; the append-only sink is
        // the compliance boundary.
        if let Err(err) = self.audit.record(&record) {
            eprintln!("warning: audit record dropped: {err:#}");
        }
    }

    // ============ Persistence ============

    /// Write the full persisted-record snapshot to `records.jsonl` in
    /// the data directory.
    pub fn persist(&self) -> anyhow::Result<()> {
        let path = self.records_path();
        let records = self.store.export_records();
        let mut out = String::new();
        for record in &records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        std::fs::create_dir_all(&self.config.data.dir)?;
        std::fs::write(&path, out)?;
        Ok(())
    }

    /// Rebuild the store and both indexes from persisted chunk records
    /// alone. Returns the number of chunks re-indexed.
    pub fn rebuild(&self) -> anyhow::Result<usize> {
        let path = self.records_path();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let mut records: Vec<PersistedChunkRecord> = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        let indexable = self.store.import_records(records);
        self.lexical.publish(&indexable, &[]);
        let vector_entries: Vec<(String, Vec<f32>, i64)> = indexable
            .iter()
            .filter_map(|chunk| {
                chunk
                    .embedding
                    .as_ref()
                    .map(|v| (chunk.id.clone(), v.clone(), chunk.meta.updated_at))
            })
            .collect();
        self.vector
            .publish(&vector_entries, &[])
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(indexable.len())
    }

    pub fn records_path(&self) -> PathBuf {
        self.config.data.dir.join("records.jsonl")
    }
}

fn abstention_pack() -> ContextPack {
    ContextPack {
        response_id: Uuid::new_v4().to_string(),
        passages: Vec::new(),
        flags: PackFlags {
            insufficient_evidence: true,
            ..Default::default()
        },
        abstained: true,
    }
}

fn validate_input(input: &DocumentInput) -> Result<()> {
    if input.id.trim().is_empty() {
        return Err(RetrievalError::validation("id", "must not be empty"));
    }
    if input.source_uri.trim().is_empty() {
        return Err(RetrievalError::validation("source_uri", "must not be empty"));
    }
    if input.body.trim().is_empty() {
        return Err(RetrievalError::validation("body", "must not be empty"));
    }
    if input.release.trim().is_empty() {
        return Err(RetrievalError::validation("release", "must not be empty"));
    }
    if input.language.trim().is_empty() {
        return Err(RetrievalError::validation("language", "must not be empty"));
    }
    Ok(())
}
