//! Knowledge entries and filters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AgentId, AttemptId};

/// Unique knowledge entry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new() -> Self {
        EntryId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}

/// What sort of thing an entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnowledgeKind {
    Experience,
    Knowledge { domain: String },
    Pattern { pattern_type: String },
}

impl KnowledgeKind {
    pub fn tag(&self) -> KindTag {
        match self {
            KnowledgeKind::Experience => KindTag::Experience,
            KnowledgeKind::Knowledge { .. } => KindTag::Knowledge,
            KnowledgeKind::Pattern { .. } => KindTag::Pattern,
        }
    }

    /// Domain or pattern type, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            KnowledgeKind::Experience => None,
            KnowledgeKind::Knowledge { domain } => Some(domain),
            KnowledgeKind::Pattern { pattern_type } => Some(pattern_type),
        }
    }
}

/// Kind discriminant without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindTag {
    Experience,
    Knowledge,
    Pattern,
}

/// Who wrote an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Stage name (`analyze`, `research`, ...) or external writer id.
    pub writer: String,
    pub attempt_id: Option<AttemptId>,
}

impl Provenance {
    pub fn external(writer: impl Into<String>) -> Self {
        Self {
            writer: writer.into(),
            attempt_id: None,
        }
    }

    pub fn stage(stage: &str, attempt_id: AttemptId) -> Self {
        Self {
            writer: stage.to_string(),
            attempt_id: Some(attempt_id),
        }
    }
}

/// One unit of learned information scoped to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: EntryId,
    pub agent_id: AgentId,
    pub kind: KnowledgeKind,
    pub content: serde_json::Value,
    /// Free-text retrieval terms.
    #[serde(default)]
    pub key_terms: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub provenance: Provenance,
    pub timestamp: DateTime<Utc>,
    /// Stored importance in 0.0..=1.0; drives eviction order.
    pub relevance: f64,
    /// Write version stamp; each write of the same id must carry a higher one.
    pub version: u64,
    #[serde(default)]
    pub access_count: u64,
}

impl KnowledgeEntry {
    pub fn new(agent_id: impl Into<AgentId>, kind: KnowledgeKind, content: serde_json::Value) -> Self {
        let relevance = match kind {
            KnowledgeKind::Experience => 0.5,
            KnowledgeKind::Knowledge { .. } => 0.8,
            KnowledgeKind::Pattern { .. } => 0.7,
        };
        Self {
            id: EntryId::new(),
            agent_id: agent_id.into(),
            kind,
            content,
            key_terms: Vec::new(),
            embedding: None,
            provenance: Provenance::external("api"),
            timestamp: Utc::now(),
            relevance,
            version: 1,
            access_count: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<EntryId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_key_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_terms = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance.clamp(0.0, 1.0);
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Next version of this entry carrying new content.
    pub fn revised(&self, content: serde_json::Value) -> Self {
        Self {
            content,
            timestamp: Utc::now(),
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Lowercased key terms plus serialized content, for keyword matching.
    pub fn searchable_text(&self) -> String {
        let mut text = self.key_terms.join(" ");
        text.push(' ');
        text.push_str(&self.content.to_string());
        text.to_lowercase()
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId(s)
    }
}

/// Restricts a query to one kind and optionally one domain / pattern type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeFilter {
    pub kind: Option<KindTag>,
    pub label: Option<String>,
}

impl KnowledgeFilter {
    pub fn experiences() -> Self {
        Self {
            kind: Some(KindTag::Experience),
            label: None,
        }
    }

    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            kind: Some(KindTag::Knowledge),
            label: Some(domain.into()),
        }
    }

    pub fn pattern(pattern_type: impl Into<String>) -> Self {
        Self {
            kind: Some(KindTag::Pattern),
            label: Some(pattern_type.into()),
        }
    }

    pub fn kind(kind: KindTag) -> Self {
        Self {
            kind: Some(kind),
            label: None,
        }
    }

    pub fn matches(&self, entry: &KnowledgeEntry) -> bool {
        if let Some(kind) = self.kind {
            if entry.kind.tag() != kind {
                return false;
            }
        }
        match &self.label {
            Some(label) => entry.kind.label() == Some(label.as_str()),
            None => true,
        }
    }
}
