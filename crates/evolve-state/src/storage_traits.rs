//! Storage trait definitions
//!
//! These traits define the persistence collaborator the evolution core
//! consumes:
//! - `DocumentStore`: revisioned JSON documents with compare-and-swap
//!   (agent records, knowledge entries)
//! - `AppendLog`: append-only streams (evolution attempt history)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! via the `fakes` module; `SurrealEvolutionStore` is the durable backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// DocumentStore: revisioned documents
// ---------------------------------------------------------------------------

/// A stored JSON document.
///
/// `revision` starts at 1 on insert and increases by exactly one on every
/// successful write. It is the compare-and-swap token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub key: String,
    pub revision: u64,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Deserialize the body into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Revisioned document store.
///
/// Guarantees:
/// - Every write is atomic: readers observe either the old or the new body.
/// - `compare_and_swap` succeeds only when the stored revision equals
///   `expected_revision`; otherwise it fails with `RevisionConflict` and
///   leaves the document untouched.
/// - `delete` is idempotent.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. `Ok(None)` when absent.
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Document>>;

    /// Create a document. Fails with `AlreadyExists` if the key is taken.
    async fn insert(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> StorageResult<Document>;

    /// Create or overwrite a document unconditionally.
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> StorageResult<Document>;

    /// Overwrite a document only if its revision still equals `expected_revision`.
    async fn compare_and_swap(
        &self,
        collection: &str,
        key: &str,
        expected_revision: u64,
        body: serde_json::Value,
    ) -> StorageResult<Document>;

    /// Remove a document. Returns `true` if something was removed.
    async fn delete(&self, collection: &str, key: &str) -> StorageResult<bool>;

    /// All documents in a collection, ordered by key.
    async fn list(&self, collection: &str) -> StorageResult<Vec<Document>>;

    /// Remove every document in a collection. Returns the number removed.
    async fn clear(&self, collection: &str) -> StorageResult<usize>;
}

// ---------------------------------------------------------------------------
// AppendLog: append-only streams
// ---------------------------------------------------------------------------

/// One record in an append-only stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub stream: String,
    /// Monotonic sequence number within the stream, starting at 1.
    pub seq: u64,
    pub body: serde_json::Value,
    pub appended_at: DateTime<Utc>,
}

/// Append-only log.
///
/// Guarantees:
/// - Records within a stream are ordered by a gap-free `seq` starting at 1.
/// - Appended records are never mutated or removed.
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Append a record and return its sequence number.
    async fn append(&self, stream: &str, body: serde_json::Value) -> StorageResult<u64>;

    /// All records of a stream, ordered by `seq`. Unknown streams are empty.
    async fn read(&self, stream: &str) -> StorageResult<Vec<LogRecord>>;
}
