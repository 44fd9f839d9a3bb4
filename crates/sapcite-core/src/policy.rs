//! Entitlement enforcement over ranked candidates.
//!
//! A candidate survives iff the caller's entitlement dominates the
//! chunk's classification level AND the chunk's module and jurisdiction
//! tags fall inside the caller's scopes. Denied candidates are removed
//! outright; they are never surfaced downstream, not even as "no
//! evidence" — leaking their existence is itself a policy violation.
//!
//! The gate runs twice per query: once before reranking (bounding the
//! expensive stage) and once after it, in case chunk metadata changed
//! between the stages.

use crate::models::{Candidate, Chunk, Entitlement};

/// Outcome of evaluating one chunk against an entitlement. Deny
/// reasons exist for the audit trail only and never reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    DenyClassification,
    DenyModuleScope,
    DenyJurisdiction,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Evaluate one chunk against the caller's entitlement.
pub fn evaluate(chunk: &Chunk, entitlement: &Entitlement) -> PolicyDecision {
    if chunk.meta.classification > entitlement.max_classification {
        return PolicyDecision::DenyClassification;
    }

    if let Some(scopes) = &entitlement.modules {
        // A chunk with no module tag is visible in every scope; a
        // tagged chunk needs at least one of its modules in scope.
        if !chunk.meta.modules.is_empty() && chunk.meta.modules.is_disjoint(scopes) {
            return PolicyDecision::DenyModuleScope;
        }
    }

    if let Some(scopes) = &entitlement.jurisdictions {
        if let Some(jurisdiction) = &chunk.meta.jurisdiction {
            if !scopes.contains(jurisdiction) {
                return PolicyDecision::DenyJurisdiction;
            }
        }
    }

    PolicyDecision::Allow
}

/// Filter a ranked candidate list, keeping order. `lookup` resolves a
/// candidate to its chunk; candidates whose chunk vanished between
/// stages are dropped as well.
pub fn filter<'a, F>(
    candidates: Vec<Candidate>,
    entitlement: &Entitlement,
    mut lookup: F,
) -> Vec<Candidate>
where
    F: FnMut(&str) -> Option<&'a Chunk>,
{
    candidates
        .into_iter()
        .filter(|candidate| {
            lookup(&candidate.chunk_id)
                .map(|chunk| evaluate(chunk, entitlement).is_allowed())
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, ChunkType, DocumentType, InheritedMeta};
    use std::collections::{BTreeMap, BTreeSet};

    fn make_chunk(classification: Classification, modules: &[&str]) -> Chunk {
        Chunk {
            id: "c1".to_string(),
            document_id: "d1".to_string(),
            chunk_index: 0,
            chunk_type: ChunkType::Paragraph,
            span_start: 0,
            span_end: 10,
            overlap_bytes: 0,
            text: "text".to_string(),
            token_count: 1,
            continuation: false,
            entities: BTreeMap::new(),
            meta: InheritedMeta {
                doc_type: DocumentType::FunctionalSpec,
                release: "S4HANA_2023".to_string(),
                modules: modules.iter().map(|m| m.to_string()).collect(),
                classification,
                jurisdiction: None,
                updated_at: 0,
            },
            embedding: None,
            quality: 1.0,
            fingerprint: 0,
            stale: false,
        }
    }

    fn entitlement(max: Classification, modules: Option<&[&str]>) -> Entitlement {
        Entitlement {
            max_classification: max,
            modules: modules.map(|ms| ms.iter().map(|m| m.to_string()).collect()),
            jurisdictions: None,
        }
    }

    #[test]
    fn test_equal_classification_allowed() {
        let chunk = make_chunk(Classification::Confidential, &[]);
        let ent = entitlement(Classification::Confidential, None);
        assert_eq!(evaluate(&chunk, &ent), PolicyDecision::Allow);
    }

    #[test]
    fn test_one_level_below_denied() {
        let chunk = make_chunk(Classification::Confidential, &[]);
        let ent = entitlement(Classification::Internal, None);
        assert_eq!(evaluate(&chunk, &ent), PolicyDecision::DenyClassification);
    }

    #[test]
    fn test_all_classification_pairs() {
        use Classification::*;
        for chunk_level in [Internal, Confidential, Restricted] {
            for caller_level in [Internal, Confidential, Restricted] {
                let chunk = make_chunk(chunk_level, &[]);
                let ent = entitlement(caller_level, None);
                let allowed = evaluate(&chunk, &ent).is_allowed();
                assert_eq!(
                    allowed,
                    caller_level >= chunk_level,
                    "chunk {chunk_level:?} vs caller {caller_level:?}"
                );
            }
        }
    }

    #[test]
    fn test_module_scope() {
        let chunk = make_chunk(Classification::Internal, &["SD"]);
        let in_scope = entitlement(Classification::Internal, Some(&["SD", "MM"]));
        let out_of_scope = entitlement(Classification::Internal, Some(&["FI"]));
        let unscoped = entitlement(Classification::Internal, None);
        assert_eq!(evaluate(&chunk, &in_scope), PolicyDecision::Allow);
        assert_eq!(evaluate(&chunk, &out_of_scope), PolicyDecision::DenyModuleScope);
        assert_eq!(evaluate(&chunk, &unscoped), PolicyDecision::Allow);
    }

    #[test]
    fn test_untagged_chunk_visible_in_any_scope() {
        let chunk = make_chunk(Classification::Internal, &[]);
        let ent = entitlement(Classification::Internal, Some(&["FI"]));
        assert_eq!(evaluate(&chunk, &ent), PolicyDecision::Allow);
    }

    #[test]
    fn test_jurisdiction_scope() {
        let mut chunk = make_chunk(Classification::Internal, &[]);
        chunk.meta.jurisdiction = Some("EU".to_string());
        let mut ent = entitlement(Classification::Internal, None);
        ent.jurisdictions = Some(BTreeSet::from(["US".to_string()]));
        assert_eq!(evaluate(&chunk, &ent), PolicyDecision::DenyJurisdiction);
        ent.jurisdictions = Some(BTreeSet::from(["EU".to_string()]));
        assert_eq!(evaluate(&chunk, &ent), PolicyDecision::Allow);
    }

    #[test]
    fn test_filter_removes_denied_and_unresolvable() {
        let allowed = make_chunk(Classification::Internal, &[]);
        let denied = make_chunk(Classification::Restricted, &[]);
        let candidates = vec![
            Candidate {
                chunk_id: "keep".to_string(),
                lexical_score: None,
                vector_score: None,
                fused_score: 0.5,
                rerank_score: None,
                updated_at: 0,
            },
            Candidate {
                chunk_id: "deny".to_string(),
                lexical_score: None,
                vector_score: None,
                fused_score: 0.4,
                rerank_score: None,
                updated_at: 0,
            },
            Candidate {
                chunk_id: "gone".to_string(),
                lexical_score: None,
                vector_score: None,
                fused_score: 0.3,
                rerank_score: None,
                updated_at: 0,
            },
        ];
        let ent = entitlement(Classification::Internal, None);
        let filtered = filter(candidates, &ent, |id| match id {
            "keep" => Some(&allowed),
            "deny" => Some(&denied),
            _ => None,
        });
        let ids: Vec<&str> = filtered.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["keep"]);
    }
}
