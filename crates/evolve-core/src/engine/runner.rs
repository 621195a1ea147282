//! One evolution attempt, end to end.
//!
//! The runner drives [`PipelineState`] through the four stages, retries
//! transient stage failures with exponential backoff, and then either
//! commits the shadow capability set with a single compare-and-swap or
//! leaves the agent record untouched. Knowledge buffered by the stages is
//! flushed only after a successful commit. Every attempt ends with exactly
//! one append to the agent's history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::repository::{AgentRepository, AttemptHistory};
use crate::config::EvolutionConfig;
use crate::domain::{
    AgentId, AgentRecord, AgentStatus, AttemptId, AttemptOutcome, AttemptReason, CapabilityDelta,
    CapabilitySet, EvolutionAttempt, EvolutionError, EvolutionStrategy, FailureClass, Stage,
    StageArtifacts, TriggerReason, ValidationReport,
};
use crate::knowledge::{KnowledgeEntry, KnowledgeKind, KnowledgeStore, Provenance};
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{PipelineSettings, PipelineState, StageContext, StageExecutors, StageOutput, Step};
use crate::registry::CapabilityRegistry;

/// What the scheduler hands the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRequest {
    pub attempt_id: AttemptId,
    pub agent_id: AgentId,
    pub trigger: TriggerReason,
    pub strategy: EvolutionStrategy,
}

pub struct EvolutionEngine {
    agents: AgentRepository,
    history: AttemptHistory,
    knowledge: Arc<KnowledgeStore>,
    registry: Arc<CapabilityRegistry>,
    stages: Arc<dyn StageExecutors>,
    config: Arc<EvolutionConfig>,
}

/// Terminal decision before it is written down.
struct Verdict {
    outcome: AttemptOutcome,
    reason: Option<AttemptReason>,
}

impl Verdict {
    fn failed(reason: AttemptReason) -> Self {
        Self {
            outcome: AttemptOutcome::Failed,
            reason: Some(reason),
        }
    }

    fn rolled_back(reason: AttemptReason) -> Self {
        Self {
            outcome: AttemptOutcome::RolledBack,
            reason: Some(reason),
        }
    }

    fn aborted(err: EvolutionError) -> Self {
        Self::failed(AttemptReason::Aborted {
            cause: err.to_string(),
        })
    }
}

/// Facts gathered while the attempt runs, kept for its history record.
#[derive(Default)]
struct AttemptRun {
    generation_at_start: u64,
    artifacts: StageArtifacts,
    projected_score: Option<f64>,
}

impl EvolutionEngine {
    pub fn new(
        agents: AgentRepository,
        history: AttemptHistory,
        knowledge: Arc<KnowledgeStore>,
        registry: Arc<CapabilityRegistry>,
        stages: Arc<dyn StageExecutors>,
        config: Arc<EvolutionConfig>,
    ) -> Self {
        Self {
            agents,
            history,
            knowledge,
            registry,
            stages,
            config,
        }
    }

    pub fn agents(&self) -> &AgentRepository {
        &self.agents
    }

    pub fn history(&self) -> &AttemptHistory {
        &self.history
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Run one attempt to a terminal outcome. The caller must hold the lease.
    pub async fn run_attempt(
        &self,
        request: AttemptRequest,
        cancel: CancellationToken,
    ) -> EvolutionAttempt {
        let span = obs::attempt_span(request.agent_id.as_str(), &request.attempt_id.to_string());
        self.run_attempt_inner(request, cancel).instrument(span).await
    }

    async fn run_attempt_inner(
        &self,
        request: AttemptRequest,
        cancel: CancellationToken,
    ) -> EvolutionAttempt {
        let started_at = Utc::now();
        obs::emit_attempt_started(
            request.agent_id.as_str(),
            &request.attempt_id.to_string(),
            request.trigger.as_str(),
            request.strategy.as_str(),
        );

        let mut run = AttemptRun::default();
        let verdict = self.drive(&request, &cancel, &mut run).await;
        if verdict.outcome != AttemptOutcome::Committed {
            self.settle(&request.agent_id, verdict.outcome).await;
        }
        self.finish(&request, run, verdict, started_at).await
    }

    /// Everything up to the terminal decision. Non-committed verdicts leave
    /// the agent's capability set and generation untouched.
    async fn drive(
        &self,
        request: &AttemptRequest,
        cancel: &CancellationToken,
        run: &mut AttemptRun,
    ) -> Verdict {
        let base = match self.agents.load(&request.agent_id).await {
            Ok(agent) => agent,
            Err(err) => return Verdict::aborted(err),
        };
        run.generation_at_start = base.generation;

        let mut ctx = StageContext::new(
            request.attempt_id,
            base.clone(),
            request.strategy,
            request.trigger,
            PipelineSettings::from_config(&self.config),
            self.knowledge.clone(),
            self.registry.clone(),
        );

        let mut state = PipelineState::Analyze;
        while let Some(stage) = state.stage() {
            if cancel.is_cancelled() {
                return Verdict::rolled_back(AttemptReason::Cancelled);
            }
            if let Err(err) = self.agents.transition(&request.agent_id, state.status()).await {
                return Verdict::aborted(err);
            }
            obs::emit_stage_entered(&request.attempt_id.to_string(), stage.as_str());

            let output = match self.run_stage(stage, &state, &mut ctx).await {
                Ok(output) => output,
                Err(reason) => return Verdict::failed(reason),
            };
            state = match state.advance(output, &base.capabilities, &mut run.artifacts) {
                Step::Next(next) => next,
                Step::Halt(reason) => return Verdict::failed(reason),
            };
        }

        let PipelineState::Decide {
            delta,
            shadow,
            report,
        } = state
        else {
            return Verdict::failed(AttemptReason::Aborted {
                cause: "pipeline ended outside the decide state".to_string(),
            });
        };
        run.projected_score = Some(report.projected_score);

        // A cancel that arrived during Validate takes effect here.
        if cancel.is_cancelled() {
            return Verdict::rolled_back(AttemptReason::Cancelled);
        }

        let current = match self.agents.load(&request.agent_id).await {
            Ok(agent) => agent,
            Err(err) => return Verdict::aborted(err),
        };
        if let Some(reason) = self.judge(&report, &current) {
            return Verdict::rolled_back(reason);
        }

        if let Err(err) = self
            .commit(&request.agent_id, run.generation_at_start, shadow)
            .await
        {
            return Verdict::failed(AttemptReason::CommitFailed {
                cause: err.to_string(),
            });
        }
        self.flush_knowledge(request, &mut ctx, &delta, &report, run.generation_at_start)
            .await;
        Verdict {
            outcome: AttemptOutcome::Committed,
            reason: None,
        }
    }

    /// Run one stage, retrying transient failures. Buffered knowledge from a
    /// failed try is discarded before the next one.
    async fn run_stage(
        &self,
        stage: Stage,
        state: &PipelineState,
        ctx: &mut StageContext,
    ) -> Result<StageOutput, AttemptReason> {
        let max_tries = 1 + self.config.transient_retry_limit;
        let base = self.config.retry_backoff_base();
        let attempt_str = ctx.attempt_id.to_string();
        let mut tries = 0;

        loop {
            tries += 1;
            let checkpoint = ctx.checkpoint();
            let err = match state.execute(self.stages.as_ref(), ctx).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            ctx.rollback_to(checkpoint);

            if err.class == FailureClass::Permanent {
                return Err(AttemptReason::StageFailed {
                    stage,
                    cause: err.message,
                });
            }
            if tries >= max_tries {
                return Err(AttemptReason::RetriesExhausted {
                    stage,
                    attempts: tries,
                    cause: err.message,
                });
            }

            let backoff = backoff_delay(base, tries);
            obs::emit_stage_retry(
                &attempt_str,
                stage.as_str(),
                tries,
                backoff.as_millis() as u64,
                &err.message,
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// `None` means commit.
    fn judge(&self, report: &ValidationReport, current: &AgentRecord) -> Option<AttemptReason> {
        let projected = report.projected_score;
        if !report.passed {
            return Some(AttemptReason::ValidationRejected { projected });
        }

        let guard = self.config.regression_guard_tolerance;
        if let Some(best) = current.best_score() {
            if projected < best - guard {
                return Some(AttemptReason::RegressionGuard {
                    projected,
                    best,
                    tolerance: guard,
                });
            }
        }

        let tolerance = self.config.commit_tolerance;
        if let Some(latest) = current.latest_score() {
            if projected < latest - tolerance {
                return Some(AttemptReason::BelowCurrentScore {
                    projected,
                    current: latest,
                    tolerance,
                });
            }
        }
        None
    }

    async fn commit(
        &self,
        agent_id: &AgentId,
        generation_at_start: u64,
        shadow: CapabilitySet,
    ) -> crate::domain::Result<()> {
        self.agents.transition(agent_id, AgentStatus::Committing).await?;
        self.agents
            .update(agent_id, |agent| {
                if agent.generation != generation_at_start {
                    return Err(EvolutionError::AgentBusy {
                        agent_id: agent.id.to_string(),
                    });
                }
                agent.capabilities = shadow.clone();
                agent.generation += 1;
                agent.last_evolved = Some(Utc::now());
                agent.status = AgentStatus::Idle;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Apply the attempt's buffered knowledge plus an experience record.
    /// The commit already happened, so failures here are logged only.
    async fn flush_knowledge(
        &self,
        request: &AttemptRequest,
        ctx: &mut StageContext,
        delta: &CapabilityDelta,
        report: &ValidationReport,
        generation_at_start: u64,
    ) {
        let mut entries = ctx.take_pending();
        entries.push(
            KnowledgeEntry::new(
                request.agent_id.clone(),
                KnowledgeKind::Experience,
                json!({
                    "attempt_id": request.attempt_id,
                    "strategy": request.strategy,
                    "delta": delta,
                    "projected_score": report.projected_score,
                    "generation": generation_at_start + 1,
                }),
            )
            .with_key_terms(delta.touched().into_iter().map(str::to_string).chain(["evolution".to_string()]))
            .with_provenance(Provenance::stage("commit", request.attempt_id)),
        );

        for entry in entries {
            match self.knowledge.put(&request.agent_id, entry).await {
                Ok(outcome) => METRICS.add_knowledge_evictions(outcome.evicted.len() as u64),
                Err(err) => tracing::warn!(
                    agent_id = %request.agent_id,
                    attempt_id = %request.attempt_id,
                    error = %err,
                    "failed to flush attempt knowledge"
                ),
            }
        }
    }

    /// Best-effort return to `Idle` after a non-committed attempt.
    async fn settle(&self, agent_id: &AgentId, outcome: AttemptOutcome) {
        let via = match outcome {
            AttemptOutcome::RolledBack => AgentStatus::RollingBack,
            _ => AgentStatus::Failed,
        };
        if let Err(err) = self.agents.settle(agent_id, via).await {
            tracing::warn!(agent_id = %agent_id, error = %err, "failed to return agent to idle");
        }
    }

    /// Record a crashed attempt and free the agent. Used when the attempt
    /// task itself died.
    pub async fn recover_aborted(&self, request: &AttemptRequest, cause: String) -> EvolutionAttempt {
        let started_at = Utc::now();
        let run = AttemptRun {
            generation_at_start: self
                .agents
                .load(&request.agent_id)
                .await
                .map(|agent| agent.generation)
                .unwrap_or_default(),
            ..AttemptRun::default()
        };
        self.settle(&request.agent_id, AttemptOutcome::Failed).await;
        let verdict = Verdict::failed(AttemptReason::Aborted { cause });
        self.finish(request, run, verdict, started_at).await
    }

    /// Record an accepted trigger that never started, so its attempt id
    /// still shows up in history. The agent record is not touched.
    pub async fn record_unstarted(&self, request: &AttemptRequest, cause: String) -> EvolutionAttempt {
        let started_at = Utc::now();
        let run = AttemptRun {
            generation_at_start: self
                .agents
                .load(&request.agent_id)
                .await
                .map(|agent| agent.generation)
                .unwrap_or_default(),
            ..AttemptRun::default()
        };
        let verdict = Verdict::failed(AttemptReason::Aborted { cause });
        self.finish(request, run, verdict, started_at).await
    }

    async fn finish(
        &self,
        request: &AttemptRequest,
        run: AttemptRun,
        verdict: Verdict,
        started_at: DateTime<Utc>,
    ) -> EvolutionAttempt {
        let attempt = EvolutionAttempt {
            id: request.attempt_id,
            agent_id: request.agent_id.clone(),
            generation_at_start: run.generation_at_start,
            trigger: request.trigger,
            strategy: request.strategy,
            artifacts: run.artifacts,
            outcome: verdict.outcome,
            reason: verdict.reason,
            projected_score: run.projected_score,
            started_at,
            finished_at: Utc::now(),
        };

        match attempt.outcome {
            AttemptOutcome::Committed => METRICS.inc_attempts_committed(),
            AttemptOutcome::RolledBack => METRICS.inc_attempts_rolled_back(),
            AttemptOutcome::Failed => METRICS.inc_attempts_failed(),
        }

        let attempt_str = attempt.id.to_string();
        if let Err(err) = self.history.append(&attempt).await {
            obs::emit_history_write_error(&attempt_str, &err);
        }
        obs::emit_attempt_finished(
            attempt.agent_id.as_str(),
            &attempt_str,
            attempt.outcome.as_str(),
            attempt.reason.as_ref().map(AttemptReason::code),
            attempt.duration_ms(),
        );
        attempt
    }
}

/// `base * 2^(retry - 1)` for the `retry`-th retry, starting at 1.
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
}
