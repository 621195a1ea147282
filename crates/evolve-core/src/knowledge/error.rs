use evolve_state::StorageError;

use super::entry::EntryId;
use crate::domain::AgentId;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("no knowledge namespace for agent {0}")]
    NamespaceNotFound(AgentId),

    #[error("knowledge entry {entry_id} not found for agent {agent_id}")]
    EntryNotFound { agent_id: AgentId, entry_id: EntryId },

    /// The writer must re-read the entry and retry with a higher version.
    #[error("stale write to entry {entry_id}: version {attempted} is not newer than stored {stored}")]
    StaleWrite {
        entry_id: EntryId,
        stored: u64,
        attempted: u64,
    },

    #[error("no durable backend configured for the knowledge store")]
    NoBackend,

    #[error("knowledge backend error: {0}")]
    Storage(#[from] StorageError),

    #[error("knowledge serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type KnowledgeResult<T> = std::result::Result<T, KnowledgeError>;
