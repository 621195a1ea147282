//! Top-level error taxonomy for the evolution core.

use serde::{Deserialize, Serialize};

use crate::knowledge::KnowledgeError;
use crate::registry::RegistryError;
use evolve_state::StorageError;

/// Whether a failure may succeed if the same operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Transient => write!(f, "transient"),
            FailureClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors surfaced by the evolution service to its callers.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent already registered: {0}")]
    AgentExists(String),

    #[error("agent {agent_id} has an evolution attempt in flight")]
    AgentBusy { agent_id: String },

    #[error("trigger queue full (capacity {capacity})")]
    Overloaded { capacity: usize },

    #[error("a manual trigger is already queued for agent {agent_id}")]
    AlreadyQueued { agent_id: String },

    #[error("invalid status transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("performance score {0} is outside 0.0..=1.0")]
    InvalidScore(f64),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for evolution core operations.
pub type Result<T> = std::result::Result<T, EvolutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evolution_error_display() {
        let err = EvolutionError::AgentNotFound("a1".to_string());
        assert!(err.to_string().contains("agent not found: a1"));

        let err = EvolutionError::Overloaded { capacity: 8 };
        assert!(err.to_string().contains("capacity 8"));

        let err = EvolutionError::AlreadyQueued {
            agent_id: "a1".to_string(),
        };
        assert!(err.to_string().contains("already queued"));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: EvolutionError = StorageError::Backend("down".to_string()).into();
        assert!(matches!(err, EvolutionError::Storage(_)));
    }

    #[test]
    fn test_failure_class_serializes_snake_case() {
        let json = serde_json::to_string(&FailureClass::Transient).unwrap();
        assert_eq!(json, "\"transient\"");
    }
}
