//! # Sapcite
//!
//! Grounded, citable retrieval over SAP technical documentation.
//!
//! Sapcite ingests normalized SAP-domain documents (ABAP code objects,
//! functional/technical specs, OSS notes, runbooks, customizing
//! guides), chunks them with entity and metadata enrichment, and
//! indexes every chunk in parallel lexical (BM25) and vector
//! structures. At query time the two candidate lists are merged with
//! reciprocal rank fusion, filtered through an entitlement policy gate
//! (twice), reranked by a cross-encoder with graceful degradation, and
//! checked by anti-hallucination guardrails before the final cited
//! context pack is handed to answer generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────────────┐
//! │ Documents │──▶│ Chunk+Entity │──▶│ Store + BM25 + Vec │
//! └───────────┘   └──────────────┘   └─────────┬──────────┘
//!                                              │
//!    query ──▶ embed ──▶ fetch ──▶ RRF ──▶ policy ──▶ rerank
//!                                              │
//!                        policy ──▶ guardrails ──▶ context pack
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`rerank`] | Cross-encoder reranking and coverage check |
//! | [`cache`] | Query-embedding LRU cache |
//! | [`audit`] | Append-only audit sink |
//! | [`orchestrator`] | Ingest and query pipelines |
//!
//! Core retrieval logic (models, chunker, indexes, fusion, policy,
//! guardrails, store) lives in the `sapcite-core` crate.

pub mod audit;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod orchestrator;
pub mod rerank;
