//! Bounded in-memory audit trail of capability invocations.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::AgentId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Agent the call was made on behalf of, when known.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub name: String,
    pub version: Option<u32>,
    pub params_digest: String,
    pub duration_ms: u64,
    /// `ok` or the registry error code.
    pub outcome: String,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == "ok"
    }
}

/// Ring buffer; the oldest record is dropped once `capacity` is reached.
#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record(&self, record: AuditRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> AuditRecord {
        AuditRecord {
            agent_id: None,
            name: name.into(),
            version: Some(1),
            params_digest: "d".into(),
            duration_ms: 1,
            outcome: "ok".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let log = AuditLog::new(2);
        log.record(record("a"));
        log.record(record("b"));
        log.record(record("c"));
        let names: Vec<_> = log.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
