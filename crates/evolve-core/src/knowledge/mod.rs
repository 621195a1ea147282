//! Knowledge store: per-agent learned facts, experiences and patterns.

pub mod entry;
pub mod error;
pub mod ranking;
pub mod store;

pub use entry::{EntryId, KindTag, KnowledgeEntry, KnowledgeFilter, KnowledgeKind, Provenance};
pub use error::{KnowledgeError, KnowledgeResult};
pub use ranking::{ranker_for, CosineRanker, KeywordRanker, RankQuery, RelevanceRanker};
pub use store::{KnowledgeQuery, KnowledgeStore, MemoryStats, PutOutcome, RankedIter, ScoredEntry};
