//! Append-only audit sink.
//!
//! Every query emits one [`AuditRecord`] carrying the query text, the
//! entitlement actually used, the candidate ids at each pipeline stage
//! (pre-filter, post-policy, post-rerank), the final flags, and the
//! response id. Records are append-only: sinks never mutate or rewrite
//! what was already written. Long-term compliance storage consumes the
//! stream; it is not implemented here.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sapcite_core::entities::EntityMap;
use sapcite_core::guardrail::Verdict;
use sapcite_core::models::{Entitlement, PackFlags};

/// One audit record per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub response_id: String,
    pub timestamp: String,
    pub query: String,
    /// SAP entities recognized in the query text.
    pub query_entities: EntityMap,
    pub entitlement: Entitlement,
    /// Candidate chunk ids after fusion, before the policy pre-filter.
    pub pre_filter: Vec<String>,
    /// Candidate chunk ids that survived the policy gate.
    pub post_policy: Vec<String>,
    /// Candidate chunk ids in final order after reranking and guardrails.
    pub post_rerank: Vec<String>,
    pub verdict: Verdict,
    pub flags: PackFlags,
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// JSONL file sink, one record per line, append-only.
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Shared sinks: lets tests keep a handle on the sink they hand to the
/// orchestrator.
impl<T: AuditSink> AuditSink for std::sync::Arc<T> {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        (**self).record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapcite_core::models::Classification;

    fn make_record(id: &str) -> AuditRecord {
        AuditRecord {
            response_id: id.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            query: "VA01 pricing error".to_string(),
            query_entities: EntityMap::new(),
            entitlement: Entitlement {
                max_classification: Classification::Internal,
                modules: None,
                jurisdictions: None,
            },
            pre_filter: vec!["c1".to_string(), "c2".to_string()],
            post_policy: vec!["c1".to_string()],
            post_rerank: vec!["c1".to_string()],
            verdict: Verdict::Pass,
            flags: PackFlags::default(),
        }
    }

    #[test]
    fn test_memory_sink_appends() {
        let sink = MemoryAuditSink::new();
        sink.record(&make_record("r1")).unwrap();
        sink.record(&make_record("r2")).unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].response_id, "r1");
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(path.clone());
        sink.record(&make_record("r1")).unwrap();
        sink.record(&make_record("r2")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.response_id, "r1");
        assert_eq!(first.post_policy, vec!["c1".to_string()]);
    }
}
