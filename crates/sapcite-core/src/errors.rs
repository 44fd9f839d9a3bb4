//! Error taxonomy for the retrieval pipeline.
//!
//! Only two conditions are real failures surfaced to callers:
//! [`RetrievalError::Validation`] at ingest and
//! [`RetrievalError::ProviderUnavailable`] when no provider path remains.
//! Everything else (policy denial, insufficient evidence, conflicts,
//! release mismatches) degrades to flags on a still-returned context
//! pack and is modeled as data, not errors.

use thiserror::Error;

/// Failure conditions that propagate to callers.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// A malformed document or query field at ingest/query time. The
    /// offending field is named; nothing is partially ingested.
    #[error("validation failed for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// An external provider (embedding or rerank backend) could not be
    /// reached and no degraded path remains.
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },
}

impl RetrievalError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RetrievalError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        RetrievalError::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;
