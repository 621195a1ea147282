//! The pipeline as an explicit state machine.
//!
//! Each variant names the stage that runs next and carries the artifacts
//! that stage consumes. `advance` folds a stage's output into the next
//! state, or halts the attempt.

use super::error::StageResult;
use super::stage::{StageContext, StageExecutors};
use crate::domain::{
    AgentStatus, AttemptReason, Candidate, CapabilityDelta, CapabilitySet, ImprovementTarget,
    Stage, StageArtifacts, ValidationReport,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Analyze,
    Research {
        target: ImprovementTarget,
    },
    Generate {
        target: ImprovementTarget,
        candidates: Vec<Candidate>,
    },
    Validate {
        delta: CapabilityDelta,
        shadow: CapabilitySet,
    },
    /// All stages ran; the engine decides commit or rollback.
    Decide {
        delta: CapabilityDelta,
        shadow: CapabilitySet,
        report: ValidationReport,
    },
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Target(ImprovementTarget),
    Candidates(Vec<Candidate>),
    Delta(CapabilityDelta),
    Report(ValidationReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Next(PipelineState),
    Halt(AttemptReason),
}

impl PipelineState {
    /// The stage this state runs, or `None` once every stage has run.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Analyze => Some(Stage::Analyze),
            PipelineState::Research { .. } => Some(Stage::Research),
            PipelineState::Generate { .. } => Some(Stage::Generate),
            PipelineState::Validate { .. } => Some(Stage::Validate),
            PipelineState::Decide { .. } => None,
        }
    }

    /// Agent status while this state's stage runs.
    pub fn status(&self) -> AgentStatus {
        match self {
            PipelineState::Analyze => AgentStatus::Analyzing,
            PipelineState::Research { .. } => AgentStatus::Researching,
            PipelineState::Generate { .. } => AgentStatus::Generating,
            PipelineState::Validate { .. } | PipelineState::Decide { .. } => AgentStatus::Validating,
        }
    }

    /// Run this state's stage once. `Decide` has no stage and is a logic error
    /// to execute; it reports a permanent failure.
    pub async fn execute(
        &self,
        stages: &dyn StageExecutors,
        ctx: &mut StageContext,
    ) -> StageResult<StageOutput> {
        match self {
            PipelineState::Analyze => stages.analyze(ctx).await.map(StageOutput::Target),
            PipelineState::Research { target } => {
                stages.research(ctx, target).await.map(StageOutput::Candidates)
            }
            PipelineState::Generate { target, candidates } => stages
                .generate(ctx, target, candidates)
                .await
                .map(StageOutput::Delta),
            PipelineState::Validate { delta, shadow } => stages
                .validate(ctx, delta, shadow)
                .await
                .map(StageOutput::Report),
            PipelineState::Decide { .. } => Err(super::StageError::permanent(
                "decide state has no stage to run",
            )),
        }
    }

    /// Fold `output` into the next state, recording artifacts along the way.
    ///
    /// `base` is the capability set the shadow copy is derived from.
    pub fn advance(
        self,
        output: StageOutput,
        base: &CapabilitySet,
        artifacts: &mut StageArtifacts,
    ) -> Step {
        match (self, output) {
            (PipelineState::Analyze, StageOutput::Target(target)) => {
                artifacts.target = Some(target.clone());
                Step::Next(PipelineState::Research { target })
            }
            (PipelineState::Research { target }, StageOutput::Candidates(candidates)) => {
                artifacts.candidates = candidates.clone();
                if candidates.is_empty() {
                    return Step::Halt(AttemptReason::NoCandidates);
                }
                Step::Next(PipelineState::Generate { target, candidates })
            }
            (PipelineState::Generate { .. }, StageOutput::Delta(delta)) => {
                artifacts.delta = Some(delta.clone());
                if delta.is_empty() {
                    return Step::Halt(AttemptReason::NoCandidates);
                }
                let shadow = base.apply(&delta);
                Step::Next(PipelineState::Validate { delta, shadow })
            }
            (PipelineState::Validate { delta, shadow }, StageOutput::Report(report)) => {
                artifacts.validation = Some(report.clone());
                Step::Next(PipelineState::Decide {
                    delta,
                    shadow,
                    report,
                })
            }
            (state, output) => Step::Halt(AttemptReason::Aborted {
                cause: format!(
                    "stage output {} does not match state {:?}",
                    output_name(&output),
                    state.stage()
                ),
            }),
        }
    }
}

fn output_name(output: &StageOutput) -> &'static str {
    match output {
        StageOutput::Target(_) => "target",
        StageOutput::Candidates(_) => "candidates",
        StageOutput::Delta(_) => "delta",
        StageOutput::Report(_) => "report",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateSource, CapabilityConfig, DeltaOp};
    use serde_json::json;

    fn target() -> ImprovementTarget {
        ImprovementTarget {
            weak_capability: None,
            deficiency: "low score".into(),
            overall_score: 0.4,
            trend: 0.0,
            missing_capabilities: vec![],
            recommendations: vec![],
        }
    }

    fn add(name: &str) -> DeltaOp {
        DeltaOp::Add {
            name: name.into(),
            config: CapabilityConfig::new(1, json!({})),
        }
    }

    #[test]
    fn empty_candidates_halt_with_no_candidates() {
        let mut artifacts = StageArtifacts::default();
        let step = PipelineState::Research { target: target() }.advance(
            StageOutput::Candidates(vec![]),
            &CapabilitySet::new(),
            &mut artifacts,
        );
        assert_eq!(step, Step::Halt(AttemptReason::NoCandidates));
    }

    #[test]
    fn generate_builds_shadow_without_touching_base() {
        let base = CapabilitySet::new().with("a", CapabilityConfig::new(1, json!({})));
        let delta = CapabilityDelta {
            ops: vec![add("b")],
            rationale: "add b".into(),
            expected_gain: 0.1,
        };
        let candidates = vec![Candidate {
            change: add("b"),
            description: "add b".into(),
            source: CandidateSource::Playbook,
            expected_gain: 0.1,
            confidence: 0.7,
        }];
        let mut artifacts = StageArtifacts::default();
        let step = PipelineState::Generate {
            target: target(),
            candidates,
        }
        .advance(StageOutput::Delta(delta), &base, &mut artifacts);

        match step {
            Step::Next(PipelineState::Validate { shadow, .. }) => {
                assert!(shadow.contains("a"));
                assert!(shadow.contains("b"));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(!base.contains("b"));
        assert!(artifacts.delta.is_some());
    }

    #[test]
    fn mismatched_output_aborts() {
        let mut artifacts = StageArtifacts::default();
        let step = PipelineState::Analyze.advance(
            StageOutput::Candidates(vec![]),
            &CapabilitySet::new(),
            &mut artifacts,
        );
        assert!(matches!(step, Step::Halt(AttemptReason::Aborted { .. })));
    }

    #[test]
    fn statuses_follow_stage_order() {
        assert_eq!(PipelineState::Analyze.status(), AgentStatus::Analyzing);
        assert_eq!(
            PipelineState::Research { target: target() }.status(),
            AgentStatus::Researching
        );
    }
}
