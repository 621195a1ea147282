//! In-memory implementations of the storage traits
//!
//! `MemoryDocumentStore` and `MemoryAppendLog` satisfy the trait contracts
//! without any external dependencies. Tests use them directly and the
//! daemon falls back to them when no database URL is configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryDocumentStore
// ---------------------------------------------------------------------------

/// In-memory document store backed by `collection -> key -> Document`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn document(collection: &str, key: &str, revision: u64, body: serde_json::Value) -> Document {
    Document {
        collection: collection.to_string(),
        key: key.to_string(),
        revision,
        body,
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Document>> {
        let collections = lock(&self.collections)?;
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn insert(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> StorageResult<Document> {
        let mut collections = lock(&self.collections)?;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(key) {
            return Err(StorageError::AlreadyExists {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        let doc = document(collection, key, 1, body);
        docs.insert(key.to_string(), doc.clone());
        Ok(doc)
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> StorageResult<Document> {
        let mut collections = lock(&self.collections)?;
        let docs = collections.entry(collection.to_string()).or_default();
        let revision = docs.get(key).map(|d| d.revision + 1).unwrap_or(1);
        let doc = document(collection, key, revision, body);
        docs.insert(key.to_string(), doc.clone());
        Ok(doc)
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        key: &str,
        expected_revision: u64,
        body: serde_json::Value,
    ) -> StorageResult<Document> {
        let mut collections = lock(&self.collections)?;
        let current = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(key))
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })?;
        if current.revision != expected_revision {
            return Err(StorageError::RevisionConflict {
                collection: collection.to_string(),
                key: key.to_string(),
                expected: expected_revision,
                actual: current.revision,
            });
        }
        *current = document(collection, key, expected_revision + 1, body);
        Ok(current.clone())
    }

    async fn delete(&self, collection: &str, key: &str) -> StorageResult<bool> {
        let mut collections = lock(&self.collections)?;
        Ok(collections
            .get_mut(collection)
            .map(|c| c.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, collection: &str) -> StorageResult<Vec<Document>> {
        let collections = lock(&self.collections)?;
        Ok(collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, collection: &str) -> StorageResult<usize> {
        let mut collections = lock(&self.collections)?;
        Ok(collections.remove(collection).map(|c| c.len()).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// MemoryAppendLog
// ---------------------------------------------------------------------------

/// In-memory append-only log backed by `stream -> Vec<LogRecord>`.
#[derive(Debug, Default)]
pub struct MemoryAppendLog {
    streams: Mutex<HashMap<String, Vec<LogRecord>>>,
}

impl MemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppendLog for MemoryAppendLog {
    async fn append(&self, stream: &str, body: serde_json::Value) -> StorageResult<u64> {
        let mut streams = lock(&self.streams)?;
        let records = streams.entry(stream.to_string()).or_default();
        let seq = records.len() as u64 + 1;
        records.push(LogRecord {
            stream: stream.to_string(),
            seq,
            body,
            appended_at: Utc::now(),
        });
        Ok(seq)
    }

    async fn read(&self, stream: &str) -> StorageResult<Vec<LogRecord>> {
        let streams = lock(&self.streams)?;
        Ok(streams.get(stream).cloned().unwrap_or_default())
    }
}
