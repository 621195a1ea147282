//! Per-agent leases: at most one attempt per agent at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::{AgentId, AttemptId};

/// Shared table of held leases.
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    held: Arc<Mutex<HashMap<AgentId, AttemptId>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `agent_id`, or `None` if another attempt holds it.
    pub fn try_acquire(&self, agent_id: &AgentId, attempt_id: AttemptId) -> Option<LeaseGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(agent_id) {
            return None;
        }
        held.insert(agent_id.clone(), attempt_id);
        Some(LeaseGuard {
            table: self.clone(),
            agent_id: agent_id.clone(),
            attempt_id,
        })
    }

    pub fn holder(&self, agent_id: &AgentId) -> Option<AttemptId> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .copied()
    }

    pub fn is_leased(&self, agent_id: &AgentId) -> bool {
        self.holder(agent_id).is_some()
    }

    pub fn active(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, agent_id: &AgentId, attempt_id: AttemptId) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.get(agent_id) == Some(&attempt_id) {
            held.remove(agent_id);
        }
    }
}

/// RAII lease handle. Dropping it releases the lease on every exit path,
/// including panics and cancellation.
#[derive(Debug)]
pub struct LeaseGuard {
    table: LeaseTable,
    agent_id: AgentId,
    attempt_id: AttemptId,
}

impl LeaseGuard {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.table.release(&self.agent_id, self.attempt_id);
        tracing::debug!(agent_id = %self.agent_id, attempt_id = %self.attempt_id, "lease released");
    }
}
