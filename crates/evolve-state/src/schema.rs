//! Row definitions for the SurrealDB tables
//!
//! Tables:
//! - documents: revisioned JSON documents keyed by (collection, key)
//! - log_records: append-only stream records keyed by (stream, seq)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{Document, LogRecord};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Document row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub collection: String,
    pub key: String,
    pub revision: u64,
    pub body: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl DocumentRow {
    /// First revision of a new document.
    pub fn new(collection: &str, key: &str, body: serde_json::Value) -> Self {
        DocumentRow {
            id: None,
            collection: collection.to_string(),
            key: key.to_string(),
            revision: 1,
            body,
            updated_at: Utc::now(),
        }
    }

    /// Successor revision carrying a new body. The record id is dropped so the
    /// row can be used as `UPDATE ... CONTENT`.
    pub fn next(self, body: serde_json::Value) -> Self {
        DocumentRow {
            id: None,
            revision: self.revision + 1,
            body,
            updated_at: Utc::now(),
            ..self
        }
    }
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            collection: row.collection,
            key: row.key,
            revision: row.revision,
            body: row.body,
            updated_at: row.updated_at,
        }
    }
}

/// Log record row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub stream: String,
    /// Monotonic sequence number within the stream (1-indexed)
    pub seq: u64,
    pub body: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub appended_at: DateTime<Utc>,
}

impl LogRow {
    pub fn new(stream: &str, seq: u64, body: serde_json::Value) -> Self {
        LogRow {
            id: None,
            stream: stream.to_string(),
            seq,
            body,
            appended_at: Utc::now(),
        }
    }
}

impl From<LogRow> for LogRecord {
    fn from(row: LogRow) -> Self {
        LogRecord {
            stream: row.stream,
            seq: row.seq,
            body: row.body,
            appended_at: row.appended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_bumps_revision_and_clears_id() {
        let row = DocumentRow::new("agents", "a1", serde_json::json!({"v": 1}));
        assert_eq!(row.revision, 1);

        let next = row.next(serde_json::json!({"v": 2}));
        assert_eq!(next.revision, 2);
        assert!(next.id.is_none());
        assert_eq!(next.collection, "agents");
        assert_eq!(next.body["v"], 2);
    }

    #[test]
    fn test_row_into_document() {
        let row = DocumentRow::new("knowledge", "k1", serde_json::json!("text"));
        let doc: Document = row.into();
        assert_eq!(doc.collection, "knowledge");
        assert_eq!(doc.key, "k1");
        assert_eq!(doc.revision, 1);
    }
}
