//! Evolution attempt records.
//!
//! An attempt is appended to the agent's history exactly once, when it
//! reaches a terminal outcome, and never mutated afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentId;
use super::artifacts::StageArtifacts;

/// Unique attempt identifier, allocated when a trigger is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        AttemptId(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Why an attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    PerformanceThreshold,
    Manual,
    /// Synthetic record for an attempt a previous process left unfinished.
    Recovery,
}

impl TriggerReason {
    pub fn is_manual(self) -> bool {
        self == TriggerReason::Manual
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::PerformanceThreshold => "performance_threshold",
            TriggerReason::Manual => "manual",
            TriggerReason::Recovery => "recovery",
        }
    }
}

/// How aggressive a change the attempt may propose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStrategy {
    #[default]
    Incremental,
    Major,
    Architectural,
}

impl EvolutionStrategy {
    /// How many top-ranked candidates Generate folds into the delta.
    pub fn candidate_budget(self) -> usize {
        match self {
            EvolutionStrategy::Incremental => 1,
            EvolutionStrategy::Major => 2,
            EvolutionStrategy::Architectural => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvolutionStrategy::Incremental => "incremental",
            EvolutionStrategy::Major => "major",
            EvolutionStrategy::Architectural => "architectural",
        }
    }
}

impl std::str::FromStr for EvolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incremental" => Ok(EvolutionStrategy::Incremental),
            "major" => Ok(EvolutionStrategy::Major),
            "architectural" => Ok(EvolutionStrategy::Architectural),
            other => Err(format!("unknown evolution strategy: {other}")),
        }
    }
}

/// Pipeline stage names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyze,
    Research,
    Generate,
    Validate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Research => "research",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Committed,
    RolledBack,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Committed => "committed",
            AttemptOutcome::RolledBack => "rolled_back",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// Why an attempt did not commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AttemptReason {
    /// Research produced nothing to try.
    NoCandidates,
    /// Validate passed but the projected score regressed too far below the best.
    RegressionGuard {
        projected: f64,
        best: f64,
        tolerance: f64,
    },
    /// Validate judged the shadow capability set a failure.
    ValidationRejected { projected: f64 },
    /// Projected score fell below the current score minus the commit tolerance.
    BelowCurrentScore {
        projected: f64,
        current: f64,
        tolerance: f64,
    },
    Cancelled,
    /// A stage raised a permanent failure.
    StageFailed { stage: Stage, cause: String },
    /// A stage kept failing transiently until the retry limit ran out.
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        cause: String,
    },
    /// The commit write itself failed.
    CommitFailed { cause: String },
    /// The attempt task died or lost its agent record mid-run.
    Aborted { cause: String },
}

impl AttemptReason {
    pub fn code(&self) -> &'static str {
        match self {
            AttemptReason::NoCandidates => "no_candidates",
            AttemptReason::RegressionGuard { .. } => "regression_guard",
            AttemptReason::ValidationRejected { .. } => "validation_rejected",
            AttemptReason::BelowCurrentScore { .. } => "below_current_score",
            AttemptReason::Cancelled => "cancelled",
            AttemptReason::StageFailed { .. } => "stage_failed",
            AttemptReason::RetriesExhausted { .. } => "retries_exhausted",
            AttemptReason::CommitFailed { .. } => "commit_failed",
            AttemptReason::Aborted { .. } => "aborted",
        }
    }
}

impl fmt::Display for AttemptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptReason::NoCandidates => write!(f, "research produced no candidates"),
            AttemptReason::RegressionGuard {
                projected,
                best,
                tolerance,
            } => write!(
                f,
                "projected score {projected} below historical best {best} by more than {tolerance}"
            ),
            AttemptReason::ValidationRejected { projected } => {
                write!(f, "validation rejected the change (projected {projected})")
            }
            AttemptReason::BelowCurrentScore {
                projected,
                current,
                tolerance,
            } => write!(
                f,
                "projected score {projected} below current {current} minus tolerance {tolerance}"
            ),
            AttemptReason::Cancelled => write!(f, "cancelled"),
            AttemptReason::StageFailed { stage, cause } => write!(f, "{stage} failed: {cause}"),
            AttemptReason::RetriesExhausted {
                stage,
                attempts,
                cause,
            } => write!(
                f,
                "{stage} exhausted retries after {attempts} attempts: {cause}"
            ),
            AttemptReason::CommitFailed { cause } => write!(f, "commit failed: {cause}"),
            AttemptReason::Aborted { cause } => write!(f, "attempt aborted: {cause}"),
        }
    }
}

/// One run of the pipeline for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionAttempt {
    pub id: AttemptId,
    pub agent_id: AgentId,
    pub generation_at_start: u64,
    pub trigger: TriggerReason,
    pub strategy: EvolutionStrategy,
    pub artifacts: StageArtifacts,
    pub outcome: AttemptOutcome,
    pub reason: Option<AttemptReason>,
    pub projected_score: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl EvolutionAttempt {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_candidate_budget() {
        assert_eq!(EvolutionStrategy::Incremental.candidate_budget(), 1);
        assert_eq!(EvolutionStrategy::Major.candidate_budget(), 2);
        assert_eq!(EvolutionStrategy::Architectural.candidate_budget(), 3);
        assert_eq!("major".parse::<EvolutionStrategy>(), Ok(EvolutionStrategy::Major));
        assert!("radical".parse::<EvolutionStrategy>().is_err());
    }

    #[test]
    fn reason_serializes_tagged() {
        let reason = AttemptReason::RetriesExhausted {
            stage: Stage::Validate,
            attempts: 3,
            cause: "timeout".into(),
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["reason"], "retries_exhausted");
        assert_eq!(value["stage"], "validate");
        assert!(reason.to_string().contains("exhausted retries"));
    }

    #[test]
    fn attempt_round_trips_through_json() {
        let now = Utc::now();
        let attempt = EvolutionAttempt {
            id: AttemptId::new(),
            agent_id: AgentId::from("a1"),
            generation_at_start: 3,
            trigger: TriggerReason::Manual,
            strategy: EvolutionStrategy::Major,
            artifacts: StageArtifacts::default(),
            outcome: AttemptOutcome::RolledBack,
            reason: Some(AttemptReason::Cancelled),
            projected_score: None,
            started_at: now,
            finished_at: now,
        };
        let back: EvolutionAttempt =
            serde_json::from_value(serde_json::to_value(&attempt).unwrap()).unwrap();
        assert_eq!(back, attempt);
    }
}
