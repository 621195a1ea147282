//! `EvolutionService`: the facade an API or dashboard layer talks to.
//!
//! Everything here is synchronous from the caller's point of view except
//! attempt outcomes, which are observable only through
//! [`EvolutionService::get_evolution_history`].

use std::sync::Arc;
use std::time::Duration;

use evolve_state::{AppendLog, DocumentStore, MemoryAppendLog, MemoryDocumentStore};
use serde_json::Value;
use tracing::{info, instrument};

use crate::config::EvolutionConfig;
use crate::domain::{
    AgentId, AgentRecord, AgentSummary, AttemptId, CapabilitySet, EvolutionAttempt, EvolutionError,
    EvolutionStrategy, Result, TriggerReason,
};
use crate::engine::{AgentRepository, AttemptHistory, EvolutionEngine, Scheduler, TriggerOutcome};
use crate::knowledge::{KnowledgeEntry, KnowledgeFilter, KnowledgeStore, MemoryStats, PutOutcome};
use crate::pipeline::{DefaultStages, StageExecutors};
use crate::registry::{
    register_defaults, CapabilityDescriptor, CapabilityHandler, CapabilityRegistry,
    CapabilityStats, InvocationBudget,
};

pub struct EvolutionServiceBuilder {
    config: EvolutionConfig,
    store: Option<Arc<dyn DocumentStore>>,
    log: Option<Arc<dyn AppendLog>>,
    stages: Option<Arc<dyn StageExecutors>>,
    persist_knowledge: bool,
    builtin_capabilities: bool,
}

impl EvolutionServiceBuilder {
    /// Backend for agent records (and knowledge, with [`persist_knowledge`](Self::persist_knowledge)).
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Backend for attempt history.
    pub fn log(mut self, log: Arc<dyn AppendLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn stages(mut self, stages: Arc<dyn StageExecutors>) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Write knowledge entries through to the document store.
    pub fn persist_knowledge(mut self, enabled: bool) -> Self {
        self.persist_knowledge = enabled;
        self
    }

    /// Skip registering the default capabilities.
    pub fn without_builtin_capabilities(mut self) -> Self {
        self.builtin_capabilities = false;
        self
    }

    /// Validate the config, wire the components and start the worker pool.
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<EvolutionService> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()));
        let log = self.log.unwrap_or_else(|| Arc::new(MemoryAppendLog::new()));
        let stages = self
            .stages
            .unwrap_or_else(|| Arc::new(DefaultStages::default()));

        let mut knowledge = KnowledgeStore::from_config(&config);
        if self.persist_knowledge {
            knowledge = knowledge.with_backend(store.clone());
        }
        let knowledge = Arc::new(knowledge);

        let registry = Arc::new(CapabilityRegistry::from_config(&config));
        if self.builtin_capabilities {
            register_defaults(&registry)?;
        }

        let engine = Arc::new(EvolutionEngine::new(
            AgentRepository::new(store),
            AttemptHistory::new(log),
            knowledge,
            registry,
            stages,
            config.clone(),
        ));
        let scheduler = Scheduler::start(engine.clone());

        info!(
            workers = config.worker_pool_size,
            queue_capacity = config.trigger_queue_capacity,
            ranker = engine.knowledge().ranker_name(),
            "evolution service ready"
        );
        Ok(EvolutionService { engine, scheduler })
    }
}

pub struct EvolutionService {
    engine: Arc<EvolutionEngine>,
    scheduler: Scheduler,
}

impl EvolutionService {
    pub fn builder(config: EvolutionConfig) -> EvolutionServiceBuilder {
        EvolutionServiceBuilder {
            config,
            store: None,
            log: None,
            stages: None,
            persist_knowledge: false,
            builtin_capabilities: true,
        }
    }

    /// In-memory backends and the default stages.
    pub fn in_memory(config: EvolutionConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &EvolutionConfig {
        self.engine.config()
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.engine.registry()
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        self.engine.knowledge()
    }

    // ---- agents ----

    #[instrument(skip_all)]
    pub async fn register_agent(
        &self,
        id: impl Into<AgentId>,
        name: impl Into<String>,
        capabilities: CapabilitySet,
    ) -> Result<AgentRecord> {
        let agent = AgentRecord::new(id, name, capabilities);
        let created = self.engine.agents().create(&agent).await?;
        self.engine.knowledge().ensure_namespace(&created.id);
        info!(agent_id = %created.id, capabilities = created.capabilities.len(), "agent registered");
        Ok(created)
    }

    pub async fn get_agent(&self, id: &AgentId) -> Result<AgentRecord> {
        self.engine.agents().load(id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        let agents = self.engine.agents().list().await?;
        Ok(agents.iter().map(AgentRecord::summary).collect())
    }

    /// Append a performance score in `0.0..=1.0`.
    pub async fn record_performance(&self, id: &AgentId, score: f64) -> Result<AgentRecord> {
        if !(0.0..=1.0).contains(&score) {
            return Err(EvolutionError::InvalidScore(score));
        }
        self.engine
            .agents()
            .update(id, |agent| {
                agent.record_score(score);
                Ok(())
            })
            .await
    }

    /// Remove an idle agent and its knowledge. Attempt history is kept.
    ///
    /// The agent's lease is held throughout, so no trigger can start an
    /// attempt against the record while it is being removed.
    #[instrument(skip_all, fields(agent_id = %id))]
    pub async fn decommission_agent(&self, id: &AgentId) -> Result<()> {
        self.engine.agents().load(id).await?;
        let busy = || EvolutionError::AgentBusy {
            agent_id: id.to_string(),
        };
        let _lease = self
            .scheduler
            .leases()
            .try_acquire(id, AttemptId::new())
            .ok_or_else(busy)?;
        if self.scheduler.has_pending_manual(id) {
            return Err(busy());
        }
        self.engine.agents().delete(id).await?;
        let removed = self.engine.knowledge().delete(id).await?;
        info!(agent_id = %id, knowledge_removed = removed, "agent decommissioned");
        Ok(())
    }

    // ---- evolution ----

    /// Submit a trigger with the configured default strategy.
    pub async fn trigger_evolution(&self, id: &AgentId, manual: bool) -> Result<TriggerOutcome> {
        let reason = if manual {
            TriggerReason::Manual
        } else {
            TriggerReason::PerformanceThreshold
        };
        self.scheduler.submit(id, reason, None).await
    }

    /// Manual trigger with an explicit strategy.
    pub async fn trigger_with_strategy(
        &self,
        id: &AgentId,
        strategy: EvolutionStrategy,
    ) -> Result<TriggerOutcome> {
        self.scheduler
            .submit(id, TriggerReason::Manual, Some(strategy))
            .await
    }

    /// Ask the agent's attempt to stop at the next stage boundary.
    pub async fn cancel_evolution(&self, id: &AgentId) -> Result<bool> {
        self.engine.agents().load(id).await?;
        Ok(self.scheduler.cancel(id))
    }

    /// Oldest first.
    pub async fn get_evolution_history(&self, id: &AgentId) -> Result<Vec<EvolutionAttempt>> {
        self.engine.agents().load(id).await?;
        self.engine.history().read(id).await
    }

    pub fn is_evolving(&self, id: &AgentId) -> bool {
        self.scheduler.is_busy(id)
    }

    pub fn start_periodic_evaluation(&self, interval: Duration) {
        self.scheduler.start_periodic(interval);
    }

    /// One evaluation pass over all agents, outside the ticker.
    pub async fn evaluate_all(&self) {
        self.scheduler.scan().await;
    }

    /// Stop accepting triggers and wait for queued and running attempts.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // ---- knowledge ----

    pub async fn get_memory_stats(&self, id: &AgentId) -> Result<MemoryStats> {
        self.engine.agents().load(id).await?;
        Ok(self.engine.knowledge().stats(id).await?)
    }

    /// Return agents a previous process left mid-attempt to `Idle`,
    /// recording each interrupted attempt as failed. Call once at startup
    /// when running over a durable store.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        self.scheduler.recover_interrupted().await
    }

    /// Rehydrate every registered agent's knowledge from the document store.
    /// Does nothing unless the service was built with `persist_knowledge(true)`.
    pub async fn reload_knowledge(&self) -> Result<usize> {
        let knowledge = self.engine.knowledge();
        if !knowledge.has_backend() {
            return Ok(0);
        }
        let mut total = 0;
        for agent in self.engine.agents().list().await? {
            total += knowledge.load_from_backend(&agent.id).await?;
        }
        info!(entries = total, "knowledge reloaded");
        Ok(total)
    }

    /// Store an entry written from outside the pipeline.
    pub async fn remember(&self, id: &AgentId, entry: KnowledgeEntry) -> Result<PutOutcome> {
        self.engine.agents().load(id).await?;
        Ok(self.engine.knowledge().put(id, entry).await?)
    }

    pub async fn recall(
        &self,
        id: &AgentId,
        key: &str,
        top_k: usize,
        filter: Option<&KnowledgeFilter>,
    ) -> Result<Vec<KnowledgeEntry>> {
        let query = match filter {
            Some(filter) => self.engine.knowledge().query_filtered(id, key, top_k, filter).await?,
            None => self.engine.knowledge().query(id, key, top_k).await?,
        };
        Ok(query.to_vec())
    }

    // ---- capabilities ----

    pub fn list_capabilities(&self) -> Vec<CapabilityDescriptor> {
        self.engine.registry().list()
    }

    pub fn register_capability(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<()> {
        Ok(self.engine.registry().register(descriptor, handler)?)
    }

    pub async fn invoke_capability(
        &self,
        name: &str,
        params: Value,
        budget: Option<InvocationBudget>,
    ) -> Result<Value> {
        Ok(self.engine.registry().invoke(name, params, budget).await?)
    }

    /// Invoke a capability on behalf of an agent; the call is attributed to
    /// it in the audit log and in [`agent_capability_stats`](Self::agent_capability_stats).
    pub async fn invoke_capability_as(
        &self,
        id: &AgentId,
        name: &str,
        params: Value,
        budget: Option<InvocationBudget>,
    ) -> Result<Value> {
        self.engine.agents().load(id).await?;
        Ok(self
            .engine
            .registry()
            .invoke_as(id, name, params, budget)
            .await?)
    }

    pub fn unregister_capability(&self, name: &str) -> Result<CapabilityDescriptor> {
        Ok(self.engine.registry().unregister(name)?)
    }

    pub fn capability_stats(&self, name: &str) -> Result<CapabilityStats> {
        Ok(self.engine.registry().stats(name)?)
    }

    /// Usage of each capability by one agent.
    pub async fn agent_capability_stats(&self, id: &AgentId) -> Result<Vec<CapabilityStats>> {
        self.engine.agents().load(id).await?;
        Ok(self.engine.registry().agent_stats(id))
    }
}
