//! Evolve-State: persistence for the agent evolution pipeline
//!
//! This crate owns every byte the evolution core keeps across restarts:
//! agent records, knowledge entries and the append-only attempt history.
//!
//! ## Key Components
//!
//! - `DocumentStore`: revisioned documents with compare-and-swap
//! - `AppendLog`: ordered, immutable streams
//! - `SurrealEvolutionStore`: SurrealDB implementation of both traits
//! - `fakes`: in-memory implementations for tests and ephemeral runs

mod error;
pub mod fakes;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fakes::{MemoryAppendLog, MemoryDocumentStore};
pub use storage_traits::{AppendLog, Document, DocumentStore, LogRecord, StorageResult};
pub use surreal_store::SurrealEvolutionStore;

/// Result type for evolve-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
