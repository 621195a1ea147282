//! Agent record: capability set, performance history and lifecycle status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::delta::{CapabilityDelta, DeltaOp};

/// Unique agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        AgentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        AgentId(s)
    }
}

/// Version and configuration of one capability held by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub version: u32,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl CapabilityConfig {
    pub fn new(version: u32, config: serde_json::Value) -> Self {
        Self { version, config }
    }

    /// Per-capability score, when an external writer recorded one under `config.score`.
    pub fn score(&self) -> Option<f64> {
        self.config.get("score").and_then(|s| s.as_f64())
    }
}

/// Mapping capability name -> config. Ordered so equality and serialization are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(pub BTreeMap<String, CapabilityConfig>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, config: CapabilityConfig) -> Self {
        self.0.insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityConfig> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a new set with `delta` applied. `self` is never modified.
    pub fn apply(&self, delta: &CapabilityDelta) -> CapabilitySet {
        let mut next = self.0.clone();
        for op in &delta.ops {
            match op {
                DeltaOp::Add { name, config } | DeltaOp::Modify { name, config } => {
                    next.insert(name.clone(), config.clone());
                }
                DeltaOp::Remove { name } => {
                    next.remove(name);
                }
            }
        }
        CapabilitySet(next)
    }
}

/// One timestamped performance score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSample {
    pub at: DateTime<Utc>,
    pub score: f64,
}

/// Agent lifecycle status.
///
/// `Idle` is the resting state. The remaining states are occupied only
/// while an evolution attempt holds the agent's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Analyzing,
    Researching,
    Generating,
    Validating,
    Committing,
    RollingBack,
    Failed,
}

impl AgentStatus {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Idle, Analyzing) => true,
            (Analyzing, Researching) | (Researching, Generating) | (Generating, Validating) => {
                true
            }
            (Validating, Committing) => true,
            (Analyzing | Researching | Generating | Validating, RollingBack | Failed) => true,
            (Committing, Idle | Failed) => true,
            (RollingBack | Failed, Idle) => true,
            _ => false,
        }
    }

    pub fn is_idle(self) -> bool {
        self == AgentStatus::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Analyzing => "analyzing",
            AgentStatus::Researching => "researching",
            AgentStatus::Generating => "generating",
            AgentStatus::Validating => "validating",
            AgentStatus::Committing => "committing",
            AgentStatus::RollingBack => "rolling_back",
            AgentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Versioned state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    pub capabilities: CapabilitySet,
    pub performance: Vec<ScoreSample>,
    pub status: AgentStatus,
    /// Incremented by exactly one per committed attempt.
    pub generation: u64,
    pub last_evolved: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Storage revision this snapshot was read at. Not part of the stored body.
    #[serde(skip)]
    pub revision: u64,
}

impl AgentRecord {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities,
            performance: Vec::new(),
            status: AgentStatus::Idle,
            generation: 0,
            last_evolved: None,
            created_at: Utc::now(),
            revision: 0,
        }
    }

    pub fn record_score(&mut self, score: f64) {
        self.performance.push(ScoreSample {
            at: Utc::now(),
            score,
        });
    }

    pub fn latest_score(&self) -> Option<f64> {
        self.performance.last().map(|s| s.score)
    }

    /// Highest score ever recorded.
    pub fn best_score(&self) -> Option<f64> {
        self.performance
            .iter()
            .map(|s| s.score)
            .max_by(|a, b| a.total_cmp(b))
    }

    pub fn mean_score(&self) -> Option<f64> {
        if self.performance.is_empty() {
            return None;
        }
        let sum: f64 = self.performance.iter().map(|s| s.score).sum();
        Some(sum / self.performance.len() as f64)
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            generation: self.generation,
            capability_count: self.capabilities.len(),
            latest_score: self.latest_score(),
            last_evolved: self.last_evolved,
        }
    }
}

/// Listing view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub generation: u64,
    pub capability_count: usize,
    pub latest_score: Option<f64>,
    pub last_evolved: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps() -> CapabilitySet {
        CapabilitySet::new()
            .with("data_analysis", CapabilityConfig::new(1, json!({"score": 0.4})))
            .with("report_generation", CapabilityConfig::new(2, json!({})))
    }

    #[test]
    fn legal_pipeline_path() {
        use AgentStatus::*;
        let path = [Idle, Analyzing, Researching, Generating, Validating, Committing, Idle];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn illegal_transitions_rejected() {
        use AgentStatus::*;
        assert!(!Idle.can_transition_to(Validating));
        assert!(!Idle.can_transition_to(RollingBack));
        assert!(!Analyzing.can_transition_to(Committing));
        assert!(!Committing.can_transition_to(RollingBack));
        assert!(!Failed.can_transition_to(Analyzing));
    }

    #[test]
    fn any_pipeline_state_may_abort() {
        use AgentStatus::*;
        for s in [Analyzing, Researching, Generating, Validating] {
            assert!(s.can_transition_to(RollingBack));
            assert!(s.can_transition_to(Failed));
        }
    }

    #[test]
    fn apply_delta_leaves_original_untouched() {
        let base = caps();
        let delta = CapabilityDelta {
            ops: vec![
                DeltaOp::Add {
                    name: "decision_support".into(),
                    config: CapabilityConfig::new(1, json!({})),
                },
                DeltaOp::Modify {
                    name: "data_analysis".into(),
                    config: CapabilityConfig::new(2, json!({"score": 0.7})),
                },
                DeltaOp::Remove {
                    name: "report_generation".into(),
                },
            ],
            rationale: String::new(),
            expected_gain: 0.0,
        };

        let next = base.apply(&delta);
        assert_eq!(base, caps());
        assert!(next.contains("decision_support"));
        assert!(!next.contains("report_generation"));
        assert_eq!(next.get("data_analysis").map(|c| c.version), Some(2));
    }

    #[test]
    fn scores() {
        let mut agent = AgentRecord::new("a1", "scout", caps());
        assert_eq!(agent.latest_score(), None);
        agent.record_score(0.95);
        agent.record_score(0.4);
        assert_eq!(agent.latest_score(), Some(0.4));
        assert_eq!(agent.best_score(), Some(0.95));
        assert!((agent.mean_score().unwrap() - 0.675).abs() < 1e-9);
    }

    #[test]
    fn revision_is_not_serialized() {
        let mut agent = AgentRecord::new("a1", "scout", caps());
        agent.revision = 7;
        let value = serde_json::to_value(&agent).unwrap();
        assert!(value.get("revision").is_none());
        let back: AgentRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.revision, 0);
    }

    #[test]
    fn capability_score_reads_config() {
        let set = caps();
        assert_eq!(set.get("data_analysis").and_then(|c| c.score()), Some(0.4));
        assert_eq!(set.get("report_generation").and_then(|c| c.score()), None);
    }
}
