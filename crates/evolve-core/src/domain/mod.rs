//! Domain models for the evolution core.
//!
//! - `AgentRecord`: versioned capability set, score history and status
//! - `CapabilityDelta`: a proposed capability-set change
//! - `EvolutionAttempt`: append-only record of one pipeline run
//! - stage artifacts exchanged between pipeline stages

pub mod agent;
pub mod artifacts;
pub mod attempt;
pub mod delta;
pub mod digest;
pub mod error;

pub use agent::{
    AgentId, AgentRecord, AgentStatus, AgentSummary, CapabilityConfig, CapabilitySet, ScoreSample,
};
pub use artifacts::{
    rank_candidates, Candidate, CandidateSource, ImprovementTarget, StageArtifacts,
    ValidationReport,
};
pub use attempt::{
    AttemptId, AttemptOutcome, AttemptReason, EvolutionAttempt, EvolutionStrategy, Stage,
    TriggerReason,
};
pub use delta::{CapabilityDelta, DeltaOp};
pub use error::{EvolutionError, FailureClass, Result};
