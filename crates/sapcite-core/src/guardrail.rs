//! Anti-hallucination guardrails over the reranked candidate set.
//!
//! A terminal-state machine: `EVALUATING` transitions to exactly one of
//! `PASS`, `CONFLICTED`, `RELEASE_MISMATCH`, or `INSUFFICIENT`, with the
//! rules tried in that order of precedence:
//!
//! 1. empty candidate set, or every relevance below the floor →
//!    `INSUFFICIENT` (the downstream generator must abstain);
//! 2. two top candidates asserting contradictory claims about the same
//!    entity → `CONFLICTED`, both retained and flagged;
//! 3. query names a target release and the top candidate's release
//!    differs → `RELEASE_MISMATCH`, the candidate downranked and
//!    flagged;
//! 4. otherwise `PASS`.
//!
//! The engine annotates and reorders — it never deletes a candidate.
//!
//! Claim extraction is deliberately simple: a claim key is an entity
//! plus a lifecycle polarity ("available" vs "deprecated/obsolete"),
//! detected from status keywords in the sentence where the entity is
//! mentioned. Two chunks mapping the same entity to opposite polarities
//! conflict.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{Candidate, Chunk, PackFlags};

/// Terminal verdicts of the guardrail state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Conflicted,
    ReleaseMismatch,
    Insufficient,
}

/// Lifecycle polarity of a claim about an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimPolarity {
    Available,
    Deprecated,
}

/// Guardrail tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Candidates with every relevance below this floor are treated as
    /// no evidence at all.
    pub relevance_floor: f64,
    /// How many top candidates participate in conflict detection.
    pub claim_window: usize,
    /// Multiplier applied to a release-mismatched top candidate.
    pub release_penalty: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            relevance_floor: 0.005,
            claim_window: 5,
            release_penalty: 0.5,
        }
    }
}

/// A candidate with its guardrail-adjusted relevance.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub relevance: f64,
    pub release_mismatch: bool,
}

/// Result of one guardrail evaluation.
#[derive(Debug, Clone)]
pub struct GuardrailOutcome {
    pub verdict: Verdict,
    pub flags: PackFlags,
    /// All input candidates, reordered after any downranking. Nothing
    /// is removed.
    pub ordered: Vec<ScoredCandidate>,
}

/// Guardrail engine with compiled claim patterns.
pub struct GuardrailEngine {
    config: GuardrailConfig,
    negative: Regex,
    positive: Regex,
}

impl GuardrailEngine {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            negative: Regex::new(
                r"(?i)\b(obsolete|deprecated|removed|replaced|discontinued|no longer (supported|available|released))\b",
            )
            .unwrap(),
            positive: Regex::new(r"(?i)\b(available|released|supported|active|recommended)\b")
                .unwrap(),
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Run the state machine over the reranked candidates.
    ///
    /// `lookup` resolves candidates to chunks for claim and release
    /// inspection; `target_release` comes from the query context.
    pub fn evaluate<'a, F>(
        &self,
        candidates: &[Candidate],
        target_release: Option<&str>,
        mut lookup: F,
    ) -> GuardrailOutcome
    where
        F: FnMut(&str) -> Option<&'a Chunk>,
    {
        let mut ordered: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|c| ScoredCandidate {
                candidate: c.clone(),
                relevance: c.relevance(),
                release_mismatch: false,
            })
            .collect();
        let mut flags = PackFlags::default();

        // Rule 1: no usable evidence.
        let has_signal = ordered
            .iter()
            .any(|s| s.relevance >= self.config.relevance_floor);
        if ordered.is_empty() || !has_signal {
            flags.insufficient_evidence = true;
            return GuardrailOutcome {
                verdict: Verdict::Insufficient,
                flags,
                ordered,
            };
        }

        // Rule 2: contradictory claims among the top candidates.
        if self.detect_conflict(&ordered, &mut lookup) {
            flags.conflict_detected = true;
            return GuardrailOutcome {
                verdict: Verdict::Conflicted,
                flags,
                ordered,
            };
        }

        // Rule 3: top candidate from the wrong release.
        if let Some(target) = target_release {
            let top_mismatch = lookup(&ordered[0].candidate.chunk_id)
                .map(|chunk| chunk.meta.release != target)
                .unwrap_or(false);
            if top_mismatch {
                flags.release_mismatch = true;
                ordered[0].relevance *= self.config.release_penalty;
                ordered[0].release_mismatch = true;
                sort_scored(&mut ordered);
                return GuardrailOutcome {
                    verdict: Verdict::ReleaseMismatch,
                    flags,
                    ordered,
                };
            }
        }

        GuardrailOutcome {
            verdict: Verdict::Pass,
            flags,
            ordered,
        }
    }

    fn detect_conflict<'a, F>(&self, ordered: &[ScoredCandidate], lookup: &mut F) -> bool
    where
        F: FnMut(&str) -> Option<&'a Chunk>,
    {
        let mut seen: BTreeMap<String, ClaimPolarity> = BTreeMap::new();
        for scored in ordered.iter().take(self.config.claim_window) {
            let Some(chunk) = lookup(&scored.candidate.chunk_id) else {
                continue;
            };
            for (entity, polarity) in self.extract_claims(chunk) {
                match seen.get(&entity) {
                    Some(prev) if *prev != polarity => return true,
                    Some(_) => {}
                    None => {
                        seen.insert(entity, polarity);
                    }
                }
            }
        }
        false
    }

    /// Claim keys asserted by one chunk: entity -> polarity, derived
    /// from status keywords in the sentences mentioning the entity.
    /// Entities with both polarities in the same chunk are ambiguous
    /// and skipped.
    pub fn extract_claims(&self, chunk: &Chunk) -> BTreeMap<String, ClaimPolarity> {
        let mut claims: BTreeMap<String, ClaimPolarity> = BTreeMap::new();
        let mut ambiguous: Vec<String> = Vec::new();

        for values in chunk.entities.values() {
            for entity in values {
                for sentence in chunk.text.split(['.', '\n', ';']) {
                    if !sentence.contains(entity.as_str()) {
                        continue;
                    }
                    let polarity = if self.negative.is_match(sentence) {
                        Some(ClaimPolarity::Deprecated)
                    } else if self.positive.is_match(sentence) {
                        Some(ClaimPolarity::Available)
                    } else {
                        None
                    };
                    if let Some(polarity) = polarity {
                        match claims.get(entity) {
                            Some(prev) if *prev != polarity => ambiguous.push(entity.clone()),
                            Some(_) => {}
                            None => {
                                claims.insert(entity.clone(), polarity);
                            }
                        }
                    }
                }
            }
        }
        for entity in ambiguous {
            claims.remove(&entity);
        }
        claims
    }
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self::new(GuardrailConfig::default())
    }
}

fn sort_scored(ordered: &mut [ScoredCandidate]) {
    ordered.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.candidate.updated_at.cmp(&a.candidate.updated_at))
            .then_with(|| a.candidate.chunk_id.cmp(&b.candidate.chunk_id))
    });
}
