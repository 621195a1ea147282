//! Error types for evolve-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No document stored under `collection/key`.
    #[error("document not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    /// `insert` found an existing document under `collection/key`.
    #[error("document already exists: {collection}/{key}")]
    AlreadyExists { collection: String, key: String },

    /// Compare-and-swap lost the race: the stored revision moved on.
    #[error("revision conflict on {collection}/{key}: expected {expected}, found {actual}")]
    RevisionConflict {
        collection: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Backend failure (connection dropped, query rejected, lock poisoned).
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// `true` for errors a caller may resolve by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::RevisionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display_carries_revisions() {
        let err = StorageError::RevisionConflict {
            collection: "agents".into(),
            key: "a1".into(),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("agents/a1"));
        assert!(msg.contains("expected 3"));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_not_found_is_not_conflict() {
        let err = StorageError::NotFound {
            collection: "agents".into(),
            key: "ghost".into(),
        };
        assert!(!err.is_conflict());
    }
}
