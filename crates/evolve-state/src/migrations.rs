//! SurrealDB schema migrations and initialization
//!
//! Sets up the two tables backing `DocumentStore` and `AppendLog` with the
//! unique indexes the trait contracts rely on.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing evolution store schema");

    init_documents_table(db).await?;
    init_log_records_table(db).await?;

    info!("Evolution store schema initialization complete");
    Ok(())
}

/// Initialize `documents` table
///
/// Schema:
/// ```text
/// TABLE documents {
///   collection:  STRING (indexed)
///   key:         STRING
///   revision:    INT
///   body:        ANY
///   updated_at:  DATETIME
/// }
/// ```
///
/// Constraints:
/// - `(collection, key)` is unique
/// - `revision` only moves forward (enforced via conditional UPDATE)
async fn init_documents_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing documents table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS documents AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX IF NOT EXISTS idx_collection_key ON TABLE documents COLUMNS collection, key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_collection ON TABLE documents COLUMNS collection;
    "#;

    db.query(sql).await?;
    info!("✓ documents table initialized");
    Ok(())
}

/// Initialize `log_records` table
///
/// Constraints:
/// - `(stream, seq)` is unique, so concurrent appends cannot share a slot
/// - records are never updated or deleted
async fn init_log_records_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing log_records table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS log_records AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_stream_seq ON TABLE log_records COLUMNS stream, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_stream ON TABLE log_records COLUMNS stream;
    "#;

    db.query(sql).await?;
    info!("✓ log_records table initialized");
    Ok(())
}
