//! End-to-end pipeline tests: ingest through context pack, using the
//! deterministic local embedding provider and an in-memory audit sink.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use sapcite::audit::MemoryAuditSink;
use sapcite::config::{Config, DataConfig};
use sapcite::embedding::{EmbeddingProvider, LocalProvider};
use sapcite::orchestrator::{DocumentInput, Orchestrator, QueryRequest};
use sapcite::rerank::{DisabledReranker, OverlapScorer, RerankProvider};
use sapcite_core::models::{CallerRole, Classification, DocumentType, Entitlement};

fn test_config(dir: &std::path::Path) -> Config {
    let toml_str = format!("[data]\ndir = \"{}\"\n", dir.display());
    toml::from_str(&toml_str).unwrap()
}

fn build_orchestrator(
    dir: &std::path::Path,
    reranker: Box<dyn RerankProvider>,
) -> (Orchestrator, Arc<MemoryAuditSink>) {
    let config = test_config(dir);
    let sink = Arc::new(MemoryAuditSink::new());
    let embedder = Box::new(LocalProvider::new(config.embedding.dims));
    let orchestrator =
        Orchestrator::with_providers(config, embedder, reranker, Box::new(sink.clone()));
    (orchestrator, sink)
}

fn make_input(id: &str, doc_type: DocumentType, body: &str) -> DocumentInput {
    DocumentInput {
        id: id.to_string(),
        source_uri: format!("solman://{id}"),
        doc_type,
        release: "S4HANA_2023".to_string(),
        modules: BTreeSet::from(["SD".to_string()]),
        language: "en".to_string(),
        classification: Classification::Internal,
        jurisdiction: None,
        body: body.to_string(),
        created_at: Some(1_700_000_000),
        updated_at: Some(1_700_000_000),
        superseded_by: None,
    }
}

fn make_request(text: &str, entitlement: Classification) -> QueryRequest {
    QueryRequest {
        text: text.to_string(),
        role: CallerRole::Support,
        entitlement: Entitlement {
            max_classification: entitlement,
            modules: None,
            jurisdictions: None,
        },
        target_release: None,
        limit: None,
    }
}

#[tokio::test]
async fn test_ingest_then_query_returns_cited_passages() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    let report = orchestrator
        .ingest(make_input(
            "runbook-1",
            DocumentType::Runbook,
            "Symptom\nVA01 raises a pricing error during condition determination.\n\
             Cause\nThe condition records for the pricing procedure are missing.\n\
             Resolution\nMaintain the condition records and rerun pricing in the order.\n",
        ))
        .await
        .unwrap();
    assert!(!report.chunk_ids.is_empty());
    assert_eq!(report.embeddings_pending, 0);

    let pack = orchestrator
        .query(make_request("VA01 pricing error", Classification::Internal))
        .await
        .unwrap();
    assert!(!pack.abstained);
    assert!(!pack.passages.is_empty());
    assert_eq!(pack.passages[0].citation, "S1");
    assert!(pack.passages[0].chunk.text.contains("pricing"));
    assert!(pack.passages[0].relevance > 0.0);
}

#[tokio::test]
async fn test_entitlement_never_leaks_restricted_content() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sink) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    orchestrator
        .ingest(make_input(
            "internal-doc",
            DocumentType::Runbook,
            "Symptom\nVA01 pricing error appears when the user saves the sales order.\n\
             Resolution\nCheck the pricing procedure assignment for the order type.\n",
        ))
        .await
        .unwrap();

    let mut restricted = make_input(
        "restricted-doc",
        DocumentType::TechnicalSpec,
        "The VA01 pricing error traces back to a custom routine in the restricted \
         pricing user exit documented for the merger carve-out project.",
    );
    restricted.classification = Classification::Restricted;
    orchestrator.ingest(restricted).await.unwrap();

    let pack = orchestrator
        .query(make_request("VA01 pricing error", Classification::Internal))
        .await
        .unwrap();

    assert!(!pack.passages.is_empty());
    for passage in &pack.passages {
        assert_eq!(passage.chunk.document_id, "internal-doc");
    }

    // The policy stage of the audit trail must not carry the denied
    // candidate either.
    let records = sink.records();
    let last = records.last().unwrap();
    assert!(last
        .post_policy
        .iter()
        .all(|id| !id.starts_with("restricted-doc")));
    assert!(last
        .post_rerank
        .iter()
        .all(|id| !id.starts_with("restricted-doc")));
}

#[tokio::test]
async fn test_boundary_entitlement_equal_level_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    let mut confidential = make_input(
        "conf-doc",
        DocumentType::FunctionalSpec,
        "The rebate settlement spec describes VBO1 agreement processing in detail.",
    );
    confidential.classification = Classification::Confidential;
    orchestrator.ingest(confidential).await.unwrap();

    let allowed = orchestrator
        .query(make_request(
            "rebate settlement agreement",
            Classification::Confidential,
        ))
        .await
        .unwrap();
    assert!(allowed.passages.iter().any(|p| p.chunk.document_id == "conf-doc"));

    let denied = orchestrator
        .query(make_request(
            "rebate settlement agreement",
            Classification::Internal,
        ))
        .await
        .unwrap();
    assert!(denied.passages.is_empty());
    assert!(denied.abstained);
}

#[tokio::test]
async fn test_release_mismatch_downranked_and_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    let mut older = make_input(
        "note-2021",
        DocumentType::OssNote,
        "Pricing procedure configuration for VA01 with condition records maintained \
         in the legacy transaction path.",
    );
    older.release = "S4HANA_2021".to_string();
    orchestrator.ingest(older).await.unwrap();

    let mut newer = make_input(
        "note-2023",
        DocumentType::OssNote,
        "Pricing procedure configuration in VA01 using condition types within the \
         new fiori based maintenance applications for sales documents.",
    );
    newer.release = "S4HANA_2023".to_string();
    orchestrator.ingest(newer).await.unwrap();

    let mut request = make_request(
        "VA01 pricing condition records",
        Classification::Internal,
    );
    request.target_release = Some("S4HANA_2023".to_string());
    let pack = orchestrator.query(request).await.unwrap();

    assert!(pack.flags.release_mismatch);
    assert!(!pack.abstained);
    // The mismatched chunk is retained but no longer leads.
    assert_eq!(pack.passages[0].chunk.document_id, "note-2023");
    assert!(pack
        .passages
        .iter()
        .any(|p| p.chunk.document_id == "note-2021"));
}

#[tokio::test]
async fn test_reranker_unavailable_falls_back_to_fused_order() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(DisabledReranker));

    orchestrator
        .ingest(make_input(
            "runbook-1",
            DocumentType::Runbook,
            "Symptom\nThe billing due list job hangs in VF04 with update records stuck.\n\
             Resolution\nClear the stuck V2 updates in SM13 and restart the billing run.\n",
        ))
        .await
        .unwrap();

    let pack = orchestrator
        .query(make_request("billing due list stuck", Classification::Internal))
        .await
        .unwrap();

    // No failure, passages present, scores fall back to fused order.
    assert!(!pack.abstained);
    assert!(!pack.passages.is_empty());
    assert!(pack.passages[0].relevance > 0.0);
}

#[tokio::test]
async fn test_embedding_failure_abstains_instead_of_guessing() {
    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            256
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("backend unreachable")
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let sink = Arc::new(MemoryAuditSink::new());
    let orchestrator = Orchestrator::with_providers(
        config,
        Box::new(FailingProvider),
        Box::new(OverlapScorer),
        Box::new(sink.clone()),
    );

    // Ingest degrades: chunks stay lexically searchable, embeddings
    // are reported pending.
    let report = orchestrator
        .ingest(make_input(
            "doc-1",
            DocumentType::Runbook,
            "Symptom\nVA01 pricing error on save.\nResolution\nMaintain condition records.\n",
        ))
        .await
        .unwrap();
    assert!(report.embeddings_pending > 0);

    // Query embeds nothing and must abstain, not fail and not guess.
    let pack = orchestrator
        .query(make_request("VA01 pricing error", Classification::Internal))
        .await
        .unwrap();
    assert!(pack.abstained);
    assert!(pack.flags.insufficient_evidence);
    assert!(pack.passages.is_empty());
}

#[tokio::test]
async fn test_duplicate_content_hash_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    let body = "Symptom\nDelivery creation fails in VL01N with picking errors.\n\
                Resolution\nCheck the storage location determination.\n";
    orchestrator
        .ingest(make_input("doc-a", DocumentType::Runbook, body))
        .await
        .unwrap();
    let report = orchestrator
        .ingest(make_input("doc-b", DocumentType::Runbook, body))
        .await
        .unwrap();

    assert!(report.deduplicated);
    assert_eq!(orchestrator.store().document_count(), 1);

    let pack = orchestrator
        .query(make_request("VL01N picking errors", Classification::Internal))
        .await
        .unwrap();
    // Exactly one canonical chunk set answers.
    let doc_ids: BTreeSet<&str> = pack
        .passages
        .iter()
        .map(|p| p.chunk.document_id.as_str())
        .collect();
    assert_eq!(doc_ids.len(), 1);
}

#[tokio::test]
async fn test_conflicting_claims_flagged_with_both_sources_retained() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    orchestrator
        .ingest(make_input(
            "note-new",
            DocumentType::OssNote,
            "As of this release BAPI_SALESORDER_CREATEFROMDAT2 is deprecated and the \
             sales order API should be called instead for order creation scenarios.",
        ))
        .await
        .unwrap();
    orchestrator
        .ingest(make_input(
            "note-old",
            DocumentType::OssNote,
            "BAPI_SALESORDER_CREATEFROMDAT2 is released for customer use and remains the \
             recommended interface when creating sales orders from external systems.",
        ))
        .await
        .unwrap();

    let pack = orchestrator
        .query(make_request(
            "BAPI_SALESORDER_CREATEFROMDAT2 create sales order",
            Classification::Internal,
        ))
        .await
        .unwrap();

    assert!(pack.flags.conflict_detected);
    let doc_ids: BTreeSet<&str> = pack
        .passages
        .iter()
        .map(|p| p.chunk.document_id.as_str())
        .collect();
    assert!(doc_ids.contains("note-new"));
    assert!(doc_ids.contains("note-old"));
}

#[tokio::test]
async fn test_validation_error_names_field() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    let mut input = make_input("bad-doc", DocumentType::Runbook, "body");
    input.body = "   ".to_string();
    let err = orchestrator.ingest(input).await.unwrap_err();
    assert!(err.to_string().contains("body"));

    // The bad document blocked nothing else.
    let report = orchestrator
        .ingest(make_input(
            "good-doc",
            DocumentType::Runbook,
            "Symptom\nGoods movement fails in MIGO.\nResolution\nCheck posting period.\n",
        ))
        .await
        .unwrap();
    assert!(!report.chunk_ids.is_empty());
}

#[tokio::test]
async fn test_empty_index_abstains() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));
    let pack = orchestrator
        .query(make_request("anything at all", Classification::Internal))
        .await
        .unwrap();
    assert!(pack.abstained);
    assert!(pack.flags.insufficient_evidence);
}

#[tokio::test]
async fn test_audit_trail_carries_stage_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, sink) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    orchestrator
        .ingest(make_input(
            "doc-1",
            DocumentType::Runbook,
            "Symptom\nVA01 pricing error during save.\nResolution\nFix condition records.\n",
        ))
        .await
        .unwrap();

    orchestrator
        .query(make_request("VA01 pricing error", Classification::Internal))
        .await
        .unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.query, "VA01 pricing error");
    assert!(!record.pre_filter.is_empty());
    assert!(!record.post_policy.is_empty());
    assert!(!record.post_rerank.is_empty());
    assert!(!record.response_id.is_empty());
}

#[tokio::test]
async fn test_persist_and_rebuild_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));

    orchestrator
        .ingest(make_input(
            "doc-1",
            DocumentType::FunctionalSpec,
            "1. Overview\nThe output determination spec covers NAST processing for \
             billing documents and the print program assignments.\n",
        ))
        .await
        .unwrap();
    orchestrator.persist().unwrap();

    // A fresh orchestrator over the same data dir rebuilds both
    // indexes purely from the persisted records.
    let (restored, _) = build_orchestrator(dir.path(), Box::new(OverlapScorer));
    let count = restored.rebuild().unwrap();
    assert!(count > 0);

    let pack = restored
        .query(make_request(
            "output determination NAST billing",
            Classification::Internal,
        ))
        .await
        .unwrap();
    assert!(!pack.abstained);
    assert!(pack.passages.iter().any(|p| p.chunk.document_id == "doc-1"));
}
