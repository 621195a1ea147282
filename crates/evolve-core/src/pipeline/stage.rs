//! Stage executor interface and the per-attempt context stages run in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::error::{StageError, StageResult};
use crate::config::EvolutionConfig;
use crate::domain::{
    AgentRecord, AttemptId, Candidate, CapabilityDelta, CapabilitySet, EvolutionStrategy,
    ImprovementTarget, Stage, TriggerReason, ValidationReport,
};
use crate::knowledge::{KnowledgeEntry, KnowledgeFilter, KnowledgeKind, KnowledgeStore, Provenance, RankQuery};
use crate::registry::{CapabilityRegistry, InvocationBudget};

/// The four pipeline roles behind one interface.
///
/// Each method receives the previous stage's output. Implementations must
/// not write shared state directly; knowledge goes through
/// [`StageContext::remember`] and is applied only if the attempt commits.
#[async_trait]
pub trait StageExecutors: Send + Sync {
    async fn analyze(&self, ctx: &mut StageContext) -> StageResult<ImprovementTarget>;

    async fn research(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
    ) -> StageResult<Vec<Candidate>>;

    async fn generate(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
        candidates: &[Candidate],
    ) -> StageResult<CapabilityDelta>;

    async fn validate(
        &self,
        ctx: &mut StageContext,
        delta: &CapabilityDelta,
        shadow: &CapabilitySet,
    ) -> StageResult<ValidationReport>;
}

/// Tunables the stages read.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub research_top_k: usize,
    pub recent_window: usize,
    pub ideal_capabilities: Vec<String>,
    pub capability_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            research_top_k: config.research_top_k,
            recent_window: config.recent_window,
            ideal_capabilities: config.ideal_capabilities.clone(),
            capability_timeout: config.capability_timeout_default(),
        }
    }
}

/// Everything a stage may touch during one attempt.
pub struct StageContext {
    pub attempt_id: AttemptId,
    /// The agent as it was when the attempt started.
    pub agent: AgentRecord,
    pub strategy: EvolutionStrategy,
    pub trigger: TriggerReason,
    pub settings: PipelineSettings,
    knowledge: Arc<KnowledgeStore>,
    registry: Arc<CapabilityRegistry>,
    pending: Vec<KnowledgeEntry>,
}

impl StageContext {
    pub fn new(
        attempt_id: AttemptId,
        agent: AgentRecord,
        strategy: EvolutionStrategy,
        trigger: TriggerReason,
        settings: PipelineSettings,
        knowledge: Arc<KnowledgeStore>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            attempt_id,
            agent,
            strategy,
            trigger,
            settings,
            knowledge,
            registry,
            pending: Vec::new(),
        }
    }

    /// Buffer a knowledge entry written by `stage`.
    pub fn remember<I, S>(&mut self, stage: Stage, kind: KnowledgeKind, content: Value, key_terms: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = KnowledgeEntry::new(self.agent.id.clone(), kind, content)
            .with_key_terms(key_terms)
            .with_provenance(Provenance::stage(stage.as_str(), self.attempt_id));
        self.pending.push(entry);
    }

    /// Ranked entries already in the shared store. Buffered writes from this
    /// attempt are not visible here.
    pub async fn recall(
        &self,
        key: &str,
        top_k: usize,
        filter: Option<&KnowledgeFilter>,
    ) -> StageResult<Vec<KnowledgeEntry>> {
        let query = self
            .knowledge
            .query_with(&self.agent.id, RankQuery::new(key), top_k, filter)
            .await;
        match query {
            Ok(query) => Ok(query.to_vec()),
            Err(crate::knowledge::KnowledgeError::NamespaceNotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Invoke a capability under the attempt's per-call budget.
    pub async fn invoke(&self, name: &str, params: Value) -> StageResult<Value> {
        let budget = InvocationBudget::with_duration(self.settings.capability_timeout);
        self.registry
            .invoke_as(&self.agent.id, name, params, Some(budget))
            .await
            .map_err(StageError::from)
    }

    pub fn pending(&self) -> &[KnowledgeEntry] {
        &self.pending
    }

    pub(crate) fn checkpoint(&self) -> usize {
        self.pending.len()
    }

    /// Discard entries buffered since `checkpoint`.
    pub(crate) fn rollback_to(&mut self, checkpoint: usize) {
        self.pending.truncate(checkpoint);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<KnowledgeEntry> {
        std::mem::take(&mut self.pending)
    }
}
