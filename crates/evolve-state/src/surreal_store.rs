//! SurrealDB-backed `DocumentStore` and `AppendLog`
//!
//! Uses `schema::DocumentRow` and `schema::LogRow` for persistence,
//! converting to/from `storage_traits` types at the boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{DocumentRow, LogRow};
use crate::storage_traits::{AppendLog, Document, DocumentStore, LogRecord, StorageResult};

const NAMESPACE: &str = "evolve";
const DATABASE: &str = "main";

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB implementation of [`DocumentStore`] and [`AppendLog`].
///
/// Writes to a single document or stream are serialized in-process; the
/// unique indexes from [`migrations`] catch writers in other processes.
#[derive(Clone)]
pub struct SurrealEvolutionStore {
    db: Surreal<Any>,
    stream_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    write_lock: Arc<Mutex<()>>,
}

impl SurrealEvolutionStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `evolve/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealEvolutionStore connected (in-memory)");
        Ok(store)
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        debug!(url, "SurrealEvolutionStore ready");

        Ok(Self {
            db,
            stream_locks: Arc::new(Mutex::new(HashMap::new())),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_document(&self, collection: &str, key: &str) -> StorageResult<Option<DocumentRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM documents WHERE collection = $c AND key = $k")
            .bind(("c", collection.to_string()))
            .bind(("k", key.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<DocumentRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn overwrite(&self, row: DocumentRow) -> StorageResult<Document> {
        let c = row.collection.clone();
        let k = row.key.clone();
        let mut res = self
            .db
            .query("UPDATE documents CONTENT $row WHERE collection = $c AND key = $k RETURN AFTER")
            .bind(("row", row))
            .bind(("c", c.clone()))
            .bind(("k", k.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<DocumentRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .map(Document::from)
            .ok_or(StorageError::NotFound {
                collection: c,
                key: k,
            })
    }

    async fn stream_lock(&self, stream: &str) -> Arc<Mutex<()>> {
        let mut locks = self.stream_locks.lock().await;
        locks
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl DocumentStore for SurrealEvolutionStore {
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Document>> {
        Ok(self
            .fetch_document(collection, key)
            .await?
            .map(Document::from))
    }

    async fn insert(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> StorageResult<Document> {
        let _w = self.write_lock.lock().await;
        if self.fetch_document(collection, key).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }

        debug!(collection, key, "inserting document");
        let created: Option<DocumentRow> = self
            .db
            .create("documents")
            .content(DocumentRow::new(collection, key, body))
            .await
            .map_err(backend)?;

        created
            .map(Document::from)
            .ok_or_else(|| StorageError::Backend("create returned no row".to_string()))
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: serde_json::Value,
    ) -> StorageResult<Document> {
        let _w = self.write_lock.lock().await;
        match self.fetch_document(collection, key).await? {
            Some(row) => self.overwrite(row.next(body)).await,
            None => {
                let created: Option<DocumentRow> = self
                    .db
                    .create("documents")
                    .content(DocumentRow::new(collection, key, body))
                    .await
                    .map_err(backend)?;
                created
                    .map(Document::from)
                    .ok_or_else(|| StorageError::Backend("create returned no row".to_string()))
            }
        }
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        key: &str,
        expected_revision: u64,
        body: serde_json::Value,
    ) -> StorageResult<Document> {
        let _w = self.write_lock.lock().await;
        let row = self
            .fetch_document(collection, key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            })?;

        if row.revision != expected_revision {
            return Err(StorageError::RevisionConflict {
                collection: collection.to_string(),
                key: key.to_string(),
                expected: expected_revision,
                actual: row.revision,
            });
        }

        let next = row.next(body);
        let mut res = self
            .db
            .query(
                "UPDATE documents CONTENT $row \
                 WHERE collection = $c AND key = $k AND revision = $expected RETURN AFTER",
            )
            .bind(("row", next))
            .bind(("c", collection.to_string()))
            .bind(("k", key.to_string()))
            .bind(("expected", expected_revision))
            .await
            .map_err(backend)?;

        let rows: Vec<DocumentRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(updated) => Ok(updated.into()),
            None => {
                // Another process moved the revision between our read and write.
                let actual = self
                    .fetch_document(collection, key)
                    .await?
                    .map(|r| r.revision)
                    .unwrap_or(0);
                Err(StorageError::RevisionConflict {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    expected: expected_revision,
                    actual,
                })
            }
        }
    }

    async fn delete(&self, collection: &str, key: &str) -> StorageResult<bool> {
        let _w = self.write_lock.lock().await;
        let mut res = self
            .db
            .query("DELETE documents WHERE collection = $c AND key = $k RETURN BEFORE")
            .bind(("c", collection.to_string()))
            .bind(("k", key.to_string()))
            .await
            .map_err(backend)?;

        let removed: Vec<DocumentRow> = res.take(0).map_err(backend)?;
        Ok(!removed.is_empty())
    }

    async fn list(&self, collection: &str) -> StorageResult<Vec<Document>> {
        let mut res = self
            .db
            .query("SELECT * FROM documents WHERE collection = $c ORDER BY key ASC")
            .bind(("c", collection.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<DocumentRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(Document::from).collect())
    }

    async fn clear(&self, collection: &str) -> StorageResult<usize> {
        let _w = self.write_lock.lock().await;
        let mut res = self
            .db
            .query("DELETE documents WHERE collection = $c RETURN BEFORE")
            .bind(("c", collection.to_string()))
            .await
            .map_err(backend)?;

        let removed: Vec<DocumentRow> = res.take(0).map_err(backend)?;
        Ok(removed.len())
    }
}

#[async_trait]
impl AppendLog for SurrealEvolutionStore {
    async fn append(&self, stream: &str, body: serde_json::Value) -> StorageResult<u64> {
        let lock = self.stream_lock(stream).await;
        let _guard = lock.lock().await;

        let mut res = self
            .db
            .query("SELECT * FROM log_records WHERE stream = $s ORDER BY seq DESC LIMIT 1")
            .bind(("s", stream.to_string()))
            .await
            .map_err(backend)?;
        let last: Vec<LogRow> = res.take(0).map_err(backend)?;
        let seq = last.first().map(|r| r.seq + 1).unwrap_or(1);

        debug!(stream, seq, "appending log record");
        let _created: Option<LogRow> = self
            .db
            .create("log_records")
            .content(LogRow::new(stream, seq, body))
            .await
            .map_err(backend)?;

        Ok(seq)
    }

    async fn read(&self, stream: &str) -> StorageResult<Vec<LogRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM log_records WHERE stream = $s ORDER BY seq ASC")
            .bind(("s", stream.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<LogRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(LogRecord::from).collect())
    }
}
