//! Agent records and attempt history over the persistence traits.

use std::sync::Arc;

use evolve_state::{AppendLog, DocumentStore, StorageError};
use tracing::instrument;

use crate::domain::{AgentId, AgentRecord, AgentStatus, EvolutionAttempt, EvolutionError, Result};

const AGENTS: &str = "agents";

/// Optimistic-update retries before giving up on a contended record.
const MAX_CAS_RETRIES: usize = 16;

#[derive(Clone)]
pub struct AgentRepository {
    store: Arc<dyn DocumentStore>,
}

impl AgentRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, agent: &AgentRecord) -> Result<AgentRecord> {
        let body = serde_json::to_value(agent)?;
        match self.store.insert(AGENTS, agent.id.as_str(), body).await {
            Ok(doc) => {
                let mut created = agent.clone();
                created.revision = doc.revision;
                Ok(created)
            }
            Err(StorageError::AlreadyExists { .. }) => {
                Err(EvolutionError::AgentExists(agent.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn load(&self, id: &AgentId) -> Result<AgentRecord> {
        let doc = self
            .store
            .get(AGENTS, id.as_str())
            .await?
            .ok_or_else(|| EvolutionError::AgentNotFound(id.to_string()))?;
        let mut agent: AgentRecord = doc.decode()?;
        agent.revision = doc.revision;
        Ok(agent)
    }

    /// All agents, ordered by id.
    pub async fn list(&self) -> Result<Vec<AgentRecord>> {
        let docs = self.store.list(AGENTS).await?;
        docs.into_iter()
            .map(|doc| {
                let mut agent: AgentRecord = doc.decode()?;
                agent.revision = doc.revision;
                Ok(agent)
            })
            .collect()
    }

    /// Read-modify-write with compare-and-swap, retrying on revision conflicts.
    ///
    /// `apply` may run more than once and must be a pure function of the record.
    #[instrument(skip_all, fields(agent_id = %id))]
    pub async fn update<F>(&self, id: &AgentId, mut apply: F) -> Result<AgentRecord>
    where
        F: FnMut(&mut AgentRecord) -> Result<()> + Send,
    {
        let mut last_conflict = None;
        for _ in 0..MAX_CAS_RETRIES {
            let mut agent = self.load(id).await?;
            let expected = agent.revision;
            apply(&mut agent)?;
            let body = serde_json::to_value(&agent)?;
            match self
                .store
                .compare_and_swap(AGENTS, id.as_str(), expected, body)
                .await
            {
                Ok(doc) => {
                    agent.revision = doc.revision;
                    return Ok(agent);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(agent_id = %id, expected, "agent revision conflict, retrying");
                    last_conflict = Some(e);
                }
                Err(StorageError::NotFound { .. }) => {
                    return Err(EvolutionError::AgentNotFound(id.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .map(EvolutionError::from)
            .unwrap_or_else(|| EvolutionError::AgentBusy {
                agent_id: id.to_string(),
            }))
    }

    /// Move the agent to `to`, rejecting illegal lifecycle transitions.
    pub async fn transition(&self, id: &AgentId, to: AgentStatus) -> Result<AgentRecord> {
        self.update(id, |agent| {
            if agent.status == to {
                return Ok(());
            }
            if !agent.status.can_transition_to(to) {
                return Err(EvolutionError::InvalidTransition {
                    agent_id: agent.id.to_string(),
                    from: agent.status.to_string(),
                    to: to.to_string(),
                });
            }
            agent.status = to;
            Ok(())
        })
        .await
    }

    /// Return the agent to `Idle`, passing through `via` first when that is a
    /// legal step from the current status.
    pub async fn settle(&self, id: &AgentId, via: AgentStatus) -> Result<AgentRecord> {
        let current = self.load(id).await?;
        if current.status.is_idle() {
            return Ok(current);
        }
        if current.status.can_transition_to(via) {
            self.transition(id, via).await?;
        }
        self.update(id, |agent| {
            agent.status = AgentStatus::Idle;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, id: &AgentId) -> Result<bool> {
        Ok(self.store.delete(AGENTS, id.as_str()).await?)
    }
}

/// Append-only per-agent attempt history.
#[derive(Clone)]
pub struct AttemptHistory {
    log: Arc<dyn AppendLog>,
}

impl AttemptHistory {
    pub fn new(log: Arc<dyn AppendLog>) -> Self {
        Self { log }
    }

    fn stream(agent_id: &AgentId) -> String {
        format!("attempts:{agent_id}")
    }

    pub async fn append(&self, attempt: &EvolutionAttempt) -> Result<u64> {
        let body = serde_json::to_value(attempt)?;
        Ok(self.log.append(&Self::stream(&attempt.agent_id), body).await?)
    }

    /// Oldest first.
    pub async fn read(&self, agent_id: &AgentId) -> Result<Vec<EvolutionAttempt>> {
        let records = self.log.read(&Self::stream(agent_id)).await?;
        records
            .into_iter()
            .map(|r| serde_json::from_value(r.body).map_err(EvolutionError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CapabilitySet;
    use evolve_state::{MemoryAppendLog, MemoryDocumentStore};

    fn repo() -> AgentRepository {
        AgentRepository::new(Arc::new(MemoryDocumentStore::new()))
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let repo = repo();
        let agent = AgentRecord::new("a1", "A1", CapabilitySet::new());
        repo.create(&agent).await.unwrap();
        let err = repo.create(&agent).await.unwrap_err();
        assert!(matches!(err, EvolutionError::AgentExists(_)));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let repo = repo();
        let agent = AgentRecord::new("a1", "A1", CapabilitySet::new());
        repo.create(&agent).await.unwrap();
        let err = repo
            .transition(&agent.id, AgentStatus::Committing)
            .await
            .unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidTransition { .. }));
        let loaded = repo.load(&agent.id).await.unwrap();
        assert_eq!(loaded.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn settle_returns_to_idle_from_any_stage() {
        let repo = repo();
        let agent = AgentRecord::new("a1", "A1", CapabilitySet::new());
        repo.create(&agent).await.unwrap();
        repo.transition(&agent.id, AgentStatus::Analyzing).await.unwrap();
        let settled = repo.settle(&agent.id, AgentStatus::Failed).await.unwrap();
        assert_eq!(settled.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let repo = repo();
        let agent = AgentRecord::new("a1", "A1", CapabilitySet::new());
        repo.create(&agent).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            let id = agent.id.clone();
            handles.push(tokio::spawn(async move {
                repo.update(&id, |a| {
                    a.record_score(i as f64 / 10.0);
                    Ok(())
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(repo.load(&agent.id).await.unwrap().performance.len(), 8);
    }

    #[tokio::test]
    async fn history_reads_in_append_order() {
        let history = AttemptHistory::new(Arc::new(MemoryAppendLog::new()));
        assert!(history.read(&AgentId::from("a1")).await.unwrap().is_empty());
    }
}
