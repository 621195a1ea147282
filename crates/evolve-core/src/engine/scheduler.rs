//! Trigger queue and worker pool.
//!
//! Accepted triggers carry their agent's lease into a bounded queue drained
//! by a fixed set of workers. A full queue fails fast with `Overloaded`.
//! Automatic triggers against a leased agent are absorbed. A manual trigger
//! against a leased agent waits in a one-slot per-agent deferral and is
//! re-dispatched when the lease frees up or on the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::lease::{LeaseGuard, LeaseTable};
use super::runner::{AttemptRequest, EvolutionEngine};
use super::trigger::{Ineligible, TriggerPolicy};
use crate::domain::{AgentId, AttemptId, EvolutionError, EvolutionStrategy, Result, TriggerReason};
use crate::metrics::METRICS;
use crate::obs;

/// Synchronous answer to a trigger request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Queued for a worker.
    Accepted { attempt_id: AttemptId },
    /// Manual trigger parked until the agent's current attempt finishes.
    Deferred { attempt_id: AttemptId },
    /// Automatic trigger against a busy agent; nothing was queued.
    Absorbed,
    /// The agent does not currently qualify.
    Ineligible { reason: Ineligible },
}

impl TriggerOutcome {
    pub fn attempt_id(&self) -> Option<AttemptId> {
        match self {
            TriggerOutcome::Accepted { attempt_id } | TriggerOutcome::Deferred { attempt_id } => {
                Some(*attempt_id)
            }
            _ => None,
        }
    }
}

struct Job {
    request: AttemptRequest,
    cancel: CancellationToken,
    lease: LeaseGuard,
}

#[derive(Debug, Clone, Copy)]
struct DeferredTrigger {
    attempt_id: AttemptId,
    strategy: EvolutionStrategy,
}

struct Shared {
    engine: Arc<EvolutionEngine>,
    leases: LeaseTable,
    policy: TriggerPolicy,
    capacity: usize,
    tx: RwLock<Option<mpsc::Sender<Job>>>,
    /// Agents with a manual trigger queued or deferred but not yet started.
    manual_pending: Mutex<HashSet<AgentId>>,
    deferred: Mutex<HashMap<AgentId, DeferredTrigger>>,
    cancels: Mutex<HashMap<AgentId, CancellationToken>>,
    shutdown: CancellationToken,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(engine: Arc<EvolutionEngine>) -> Self {
        let config = engine.config();
        let capacity = config.trigger_queue_capacity.max(1);
        let pool_size = config.worker_pool_size.max(1);
        let policy = TriggerPolicy::from_config(config);

        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let shared = Arc::new(Shared {
            engine,
            leases: LeaseTable::new(),
            policy,
            capacity,
            tx: RwLock::new(Some(tx)),
            manual_pending: Mutex::new(HashSet::new()),
            deferred: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..pool_size)
            .map(|worker_id| {
                let shared = shared.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        shared.run_job(job).await;
                    }
                    debug!(worker_id, "evolution worker stopped");
                })
            })
            .collect();

        info!(pool_size, queue_capacity = capacity, "evolution scheduler started");
        Self {
            shared,
            workers: Mutex::new(workers),
            ticker: Mutex::new(None),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.shared.leases
    }

    /// Submit a trigger. Errors are the synchronous rejections: unknown
    /// agent, full queue, duplicate manual trigger, shutdown.
    pub async fn submit(
        &self,
        agent_id: &AgentId,
        trigger: TriggerReason,
        strategy: Option<EvolutionStrategy>,
    ) -> Result<TriggerOutcome> {
        self.shared.submit(agent_id, trigger, strategy).await
    }

    /// Request cancellation of the agent's queued or running attempt.
    /// Takes effect at the next stage boundary. Returns whether there was
    /// anything to cancel.
    pub fn cancel(&self, agent_id: &AgentId) -> bool {
        let cancels = self.shared.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        match cancels.get(agent_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, agent_id: &AgentId) -> bool {
        self.shared.leases.is_leased(agent_id)
    }

    pub fn has_pending_manual(&self, agent_id: &AgentId) -> bool {
        self.shared
            .manual_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(agent_id)
    }

    /// Settle agents a previous process left mid-attempt. Each one goes back
    /// to `Idle` and gets a `Failed` attempt with an `Aborted` reason.
    /// Agents leased in this process are skipped.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let engine = &self.shared.engine;
        let mut recovered = 0;
        for listed in engine.agents().list().await? {
            if listed.status.is_idle() {
                continue;
            }
            let attempt_id = AttemptId::new();
            let Some(_lease) = self.shared.leases.try_acquire(&listed.id, attempt_id) else {
                continue;
            };
            let agent = engine.agents().load(&listed.id).await?;
            if agent.status.is_idle() {
                continue;
            }

            warn!(agent_id = %agent.id, status = %agent.status, "recovering agent left mid-attempt");
            let request = AttemptRequest {
                attempt_id,
                agent_id: agent.id.clone(),
                trigger: TriggerReason::Recovery,
                strategy: engine.config().default_strategy,
            };
            engine
                .recover_aborted(&request, format!("interrupted while {}", agent.status))
                .await;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "interrupted attempts recovered");
        }
        Ok(recovered)
    }

    /// Spawn the periodic evaluation ticker. Replaces any running ticker.
    pub fn start_periodic(&self, interval: Duration) {
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = ticker.tick() => shared.scan().await,
                }
            }
            debug!("evolution ticker stopped");
        });
        let mut slot = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// One evaluation pass over every agent.
    pub async fn scan(&self) {
        self.shared.scan().await;
    }

    /// Stop accepting triggers, let queued and running attempts finish, and
    /// wait for the workers.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared
            .tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in join_all(workers).await {
            if let Err(err) = result {
                warn!(error = %err, "evolution worker ended abnormally");
            }
        }
        METRICS.flush();
        info!("evolution scheduler stopped");
    }
}

impl Shared {
    #[instrument(skip_all, fields(agent_id = %agent_id, trigger = trigger.as_str()))]
    async fn submit(
        &self,
        agent_id: &AgentId,
        trigger: TriggerReason,
        strategy: Option<EvolutionStrategy>,
    ) -> Result<TriggerOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(EvolutionError::ShuttingDown);
        }
        self.engine.agents().load(agent_id).await?;
        let strategy = strategy.unwrap_or(self.engine.config().default_strategy);

        if trigger.is_manual() && !self.mark_manual(agent_id) {
            METRICS.inc_triggers_rejected();
            obs::emit_trigger_rejected(agent_id.as_str(), "already_queued");
            return Err(EvolutionError::AlreadyQueued {
                agent_id: agent_id.to_string(),
            });
        }

        let attempt_id = AttemptId::new();
        let Some(lease) = self.leases.try_acquire(agent_id, attempt_id) else {
            if trigger.is_manual() {
                self.lock_deferred()
                    .insert(agent_id.clone(), DeferredTrigger { attempt_id, strategy });
                METRICS.inc_triggers_accepted();
                debug!(attempt_id = %attempt_id, "manual trigger deferred behind running attempt");
                return Ok(TriggerOutcome::Deferred { attempt_id });
            }
            METRICS.inc_triggers_absorbed();
            obs::emit_trigger_rejected(agent_id.as_str(), "busy");
            return Ok(TriggerOutcome::Absorbed);
        };

        // Re-read under the lease: an attempt that just released it has
        // already settled the record back to Idle.
        let agent = match self.engine.agents().load(agent_id).await {
            Ok(agent) => agent,
            Err(err) => {
                drop(lease);
                if trigger.is_manual() {
                    self.unmark_manual(agent_id);
                }
                return Err(err);
            }
        };
        if let Err(reason) = self.policy.check(&agent, trigger, Utc::now()) {
            drop(lease);
            if trigger.is_manual() {
                self.unmark_manual(agent_id);
            }
            METRICS.inc_triggers_rejected();
            obs::emit_trigger_rejected(agent_id.as_str(), reason.code());
            return Ok(TriggerOutcome::Ineligible { reason });
        }

        let request = AttemptRequest {
            attempt_id,
            agent_id: agent_id.clone(),
            trigger,
            strategy,
        };
        match self.enqueue(request, lease) {
            Ok(()) => {
                METRICS.inc_triggers_accepted();
                Ok(TriggerOutcome::Accepted { attempt_id })
            }
            Err(err) => {
                if trigger.is_manual() {
                    self.unmark_manual(agent_id);
                }
                METRICS.inc_triggers_rejected();
                obs::emit_trigger_rejected(agent_id.as_str(), "overloaded");
                Err(err)
            }
        }
    }

    fn enqueue(&self, request: AttemptRequest, lease: LeaseGuard) -> Result<()> {
        let tx = self.tx.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return Err(EvolutionError::ShuttingDown);
        };

        let cancel = CancellationToken::new();
        let agent_id = request.agent_id.clone();
        self.lock_cancels().insert(agent_id.clone(), cancel.clone());

        let job = Job {
            request,
            cancel,
            lease,
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_job)) => {
                self.lock_cancels().remove(&agent_id);
                Err(EvolutionError::Overloaded {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_job)) => {
                self.lock_cancels().remove(&agent_id);
                Err(EvolutionError::ShuttingDown)
            }
        }
    }

    async fn run_job(&self, job: Job) {
        let Job {
            request,
            cancel,
            lease,
        } = job;
        let agent_id = request.agent_id.clone();
        if request.trigger.is_manual() {
            self.unmark_manual(&agent_id);
        }

        let engine = self.engine.clone();
        let task_request = request.clone();
        let handle = tokio::spawn(async move { engine.run_attempt(task_request, cancel).await });
        if let Err(err) = handle.await {
            error!(agent_id = %agent_id, attempt_id = %request.attempt_id, error = %err, "evolution attempt task died");
            self.engine.recover_aborted(&request, err.to_string()).await;
        }

        self.lock_cancels().remove(&agent_id);
        drop(lease);
        self.dispatch_deferred(&agent_id).await;
    }

    /// Move a deferred manual trigger into the queue if the agent is free.
    async fn dispatch_deferred(&self, agent_id: &AgentId) {
        let Some(deferred) = self.lock_deferred().remove(agent_id) else {
            return;
        };
        let Some(lease) = self.leases.try_acquire(agent_id, deferred.attempt_id) else {
            self.lock_deferred().insert(agent_id.clone(), deferred);
            return;
        };

        let request = AttemptRequest {
            attempt_id: deferred.attempt_id,
            agent_id: agent_id.clone(),
            trigger: TriggerReason::Manual,
            strategy: deferred.strategy,
        };
        let agent = match self.engine.agents().load(agent_id).await {
            Ok(agent) => agent,
            Err(err) => {
                self.drop_deferred(&request, err.to_string()).await;
                return;
            }
        };
        if let Err(reason) = self.policy.check(&agent, TriggerReason::Manual, Utc::now()) {
            self.drop_deferred(&request, reason.to_string()).await;
            return;
        }

        match self.enqueue(request.clone(), lease) {
            Ok(()) => debug!(agent_id = %agent_id, "deferred manual trigger queued"),
            Err(EvolutionError::Overloaded { .. }) => {
                // Retried on the next tick.
                self.lock_deferred().insert(agent_id.clone(), deferred);
            }
            Err(err) => self.drop_deferred(&request, err.to_string()).await,
        }
    }

    /// Give up on a deferred manual trigger. Its attempt id was already
    /// handed out, so the drop is recorded as a failed attempt.
    async fn drop_deferred(&self, request: &AttemptRequest, cause: String) {
        warn!(agent_id = %request.agent_id, attempt_id = %request.attempt_id, cause = %cause, "dropping deferred manual trigger");
        self.unmark_manual(&request.agent_id);
        self.engine
            .record_unstarted(request, format!("deferred trigger dropped: {cause}"))
            .await;
    }

    async fn scan(&self) {
        let deferred: Vec<AgentId> = self.lock_deferred().keys().cloned().collect();
        for agent_id in deferred {
            self.dispatch_deferred(&agent_id).await;
        }

        match self.engine.agents().list().await {
            Ok(agents) => {
                for agent in agents {
                    match self
                        .submit(&agent.id, TriggerReason::PerformanceThreshold, None)
                        .await
                    {
                        Ok(TriggerOutcome::Accepted { attempt_id }) => {
                            debug!(agent_id = %agent.id, attempt_id = %attempt_id, "periodic trigger accepted");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(agent_id = %agent.id, error = %err, "periodic trigger failed");
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "periodic scan could not list agents"),
        }
        METRICS.flush();
    }

    /// Returns false if a manual trigger was already pending.
    fn mark_manual(&self, agent_id: &AgentId) -> bool {
        self.manual_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.clone())
    }

    fn unmark_manual(&self, agent_id: &AgentId) {
        self.manual_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
    }

    fn lock_deferred(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, DeferredTrigger>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancels(&self) -> std::sync::MutexGuard<'_, HashMap<AgentId, CancellationToken>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
