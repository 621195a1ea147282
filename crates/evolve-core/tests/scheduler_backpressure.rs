//! Scheduler admission: leases, queue bounds and manual-trigger slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evolve_core::domain::{Candidate, CapabilityDelta, ImprovementTarget, ValidationReport};
use evolve_core::pipeline::StageResult;
use evolve_core::{
    AgentId, AttemptOutcome, CapabilitySet, DefaultStages, EvolutionConfig, EvolutionError,
    EvolutionService, Ineligible, StageContext, StageError, StageExecutors, TriggerOutcome,
};
use evolve_state::{Document, DocumentStore, MemoryDocumentStore, StorageResult};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};

/// Default stages that report when Analyze starts and then wait for a permit.
struct Gated {
    inner: DefaultStages,
    entered: mpsc::UnboundedSender<AgentId>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl StageExecutors for Gated {
    async fn analyze(&self, ctx: &mut StageContext) -> StageResult<ImprovementTarget> {
        let _ = self.entered.send(ctx.agent.id.clone());
        let _permit = self
            .release
            .acquire()
            .await
            .map_err(|e| StageError::permanent(e.to_string()))?;
        self.inner.analyze(ctx).await
    }

    async fn research(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
    ) -> StageResult<Vec<Candidate>> {
        self.inner.research(ctx, target).await
    }

    async fn generate(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
        candidates: &[Candidate],
    ) -> StageResult<CapabilityDelta> {
        self.inner.generate(ctx, target, candidates).await
    }

    async fn validate(
        &self,
        ctx: &mut StageContext,
        delta: &CapabilityDelta,
        shadow: &CapabilitySet,
    ) -> StageResult<ValidationReport> {
        self.inner.validate(ctx, delta, shadow).await
    }
}

struct Harness {
    service: EvolutionService,
    entered: Mutex<mpsc::UnboundedReceiver<AgentId>>,
    release: Arc<Semaphore>,
}

impl Harness {
    async fn new(workers: usize, queue: usize, agents: &[&str]) -> Self {
        Self::with_store(workers, queue, agents, Arc::new(MemoryDocumentStore::new())).await
    }

    async fn with_store(
        workers: usize,
        queue: usize,
        agents: &[&str],
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let mut config = EvolutionConfig::default();
        config.worker_pool_size = workers;
        config.trigger_queue_capacity = queue;
        config.min_evolution_interval_secs = 0;
        config.performance_threshold = 0.5;
        config.retry_backoff_base_ms = 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let stages = Gated {
            inner: DefaultStages::default(),
            entered: tx,
            release: release.clone(),
        };
        let service = EvolutionService::builder(config)
            .store(store)
            .stages(Arc::new(stages))
            .build()
            .unwrap();

        for id in agents {
            service
                .register_agent(*id, *id, CapabilitySet::new())
                .await
                .unwrap();
            service
                .record_performance(&AgentId::from(*id), 0.3)
                .await
                .unwrap();
        }

        Self {
            service,
            entered: Mutex::new(rx),
            release,
        }
    }

    /// Wait until some attempt reaches Analyze.
    async fn next_started(&self) -> AgentId {
        tokio::time::timeout(Duration::from_secs(5), self.entered.lock().await.recv())
            .await
            .expect("an attempt should start")
            .expect("stage channel open")
    }

    fn open_gate(&self) {
        self.release.add_permits(1);
    }

    async fn wait_for_history(&self, id: &str, n: usize) -> Vec<evolve_core::EvolutionAttempt> {
        let id = AgentId::from(id);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let history = self.service.get_evolution_history(&id).await.unwrap();
            if history.len() >= n {
                return history;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "history for {id} stuck at {}",
                history.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn id(s: &str) -> AgentId {
    AgentId::from(s)
}

/// In-memory store whose next `get`, once armed, stalls after reading until
/// `resume` gets a permit, so the caller acts on a stale document.
struct StallingStore {
    inner: MemoryDocumentStore,
    armed: AtomicBool,
    stalled: Notify,
    resume: Semaphore,
}

impl StallingStore {
    fn new() -> Self {
        Self {
            inner: MemoryDocumentStore::new(),
            armed: AtomicBool::new(false),
            stalled: Notify::new(),
            resume: Semaphore::new(0),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for StallingStore {
    async fn get(&self, collection: &str, key: &str) -> StorageResult<Option<Document>> {
        let doc = self.inner.get(collection, key).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.stalled.notify_one();
            let _ = self.resume.acquire().await;
        }
        Ok(doc)
    }

    async fn insert(&self, collection: &str, key: &str, body: Value) -> StorageResult<Document> {
        self.inner.insert(collection, key, body).await
    }

    async fn upsert(&self, collection: &str, key: &str, body: Value) -> StorageResult<Document> {
        self.inner.upsert(collection, key, body).await
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        key: &str,
        expected_revision: u64,
        body: Value,
    ) -> StorageResult<Document> {
        self.inner
            .compare_and_swap(collection, key, expected_revision, body)
            .await
    }

    async fn delete(&self, collection: &str, key: &str) -> StorageResult<bool> {
        self.inner.delete(collection, key).await
    }

    async fn list(&self, collection: &str) -> StorageResult<Vec<Document>> {
        self.inner.list(collection).await
    }

    async fn clear(&self, collection: &str) -> StorageResult<usize> {
        self.inner.clear(collection).await
    }
}

#[tokio::test]
async fn test_full_queue_fails_fast_with_overloaded() {
    let h = Harness::new(1, 1, &["a1", "a2", "a3"]).await;

    let first = h.service.trigger_evolution(&id("a1"), true).await.unwrap();
    assert!(matches!(first, TriggerOutcome::Accepted { .. }));
    assert_eq!(h.next_started().await, id("a1"));

    // The only worker is busy; one slot left in the queue.
    let second = h.service.trigger_evolution(&id("a2"), true).await.unwrap();
    assert!(matches!(second, TriggerOutcome::Accepted { .. }));

    let err = h.service.trigger_evolution(&id("a3"), true).await.unwrap_err();
    assert!(matches!(err, EvolutionError::Overloaded { capacity: 1 }));
    // The rejected agent is left free for a later trigger.
    assert!(!h.service.is_evolving(&id("a3")));

    h.open_gate();
    h.wait_for_history("a1", 1).await;
    h.wait_for_history("a2", 1).await;
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_automatic_trigger_against_busy_agent_is_absorbed() {
    let h = Harness::new(2, 8, &["a1"]).await;

    let first = h.service.trigger_evolution(&id("a1"), false).await.unwrap();
    let attempt_id = first.attempt_id().unwrap();
    h.next_started().await;

    for _ in 0..3 {
        let again = h.service.trigger_evolution(&id("a1"), false).await.unwrap();
        assert_eq!(again, TriggerOutcome::Absorbed);
    }

    h.open_gate();
    h.wait_for_history("a1", 1).await;
    h.service.shutdown().await;

    let history = h.service.get_evolution_history(&id("a1")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, attempt_id);
}

#[tokio::test]
async fn test_back_to_back_manual_triggers_report_already_queued() {
    let h = Harness::new(1, 8, &["busy", "a1"]).await;

    // Occupy the only worker so a1's trigger stays queued.
    h.service.trigger_evolution(&id("busy"), true).await.unwrap();
    assert_eq!(h.next_started().await, id("busy"));

    let first = h.service.trigger_evolution(&id("a1"), true).await.unwrap();
    assert!(matches!(first, TriggerOutcome::Accepted { .. }));
    let err = h.service.trigger_evolution(&id("a1"), true).await.unwrap_err();
    assert!(matches!(err, EvolutionError::AlreadyQueued { .. }));

    h.open_gate();
    h.wait_for_history("a1", 1).await;
    h.service.shutdown().await;
    assert_eq!(
        h.service
            .get_evolution_history(&id("a1"))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_manual_trigger_during_attempt_is_deferred_then_runs() {
    let h = Harness::new(2, 8, &["a1"]).await;

    h.service.trigger_evolution(&id("a1"), false).await.unwrap();
    h.next_started().await;

    let deferred = h.service.trigger_evolution(&id("a1"), true).await.unwrap();
    assert!(matches!(deferred, TriggerOutcome::Deferred { .. }));
    // The deferred slot holds one trigger per agent.
    let err = h.service.trigger_evolution(&id("a1"), true).await.unwrap_err();
    assert!(matches!(err, EvolutionError::AlreadyQueued { .. }));

    h.open_gate();
    let history = h.wait_for_history("a1", 2).await;
    assert_eq!(history[1].id, deferred.attempt_id().unwrap());
    assert_eq!(history[0].outcome, AttemptOutcome::Committed);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_ineligible_automatic_trigger_is_acknowledged_without_work() {
    let h = Harness::new(1, 8, &["a1"]).await;
    h.service.record_performance(&id("a1"), 0.9).await.unwrap();

    let outcome = h.service.trigger_evolution(&id("a1"), false).await.unwrap();
    assert!(matches!(
        outcome,
        TriggerOutcome::Ineligible {
            reason: Ineligible::ScoreAboveThreshold { .. }
        }
    ));
    assert!(!h.service.is_evolving(&id("a1")));
    h.service.shutdown().await;
    assert!(h
        .service
        .get_evolution_history(&id("a1"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_agent_is_not_found() {
    let h = Harness::new(1, 8, &[]).await;
    let err = h
        .service
        .trigger_evolution(&id("ghost"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EvolutionError::AgentNotFound(_)));
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_triggers_after_shutdown_are_refused() {
    let h = Harness::new(1, 8, &["a1"]).await;
    h.service.shutdown().await;
    let err = h
        .service
        .trigger_evolution(&id("a1"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, EvolutionError::ShuttingDown));
}

#[tokio::test]
async fn test_cancel_queued_attempt_rolls_back() {
    let h = Harness::new(1, 8, &["busy", "a1"]).await;
    h.service.trigger_evolution(&id("busy"), true).await.unwrap();
    h.next_started().await;

    h.service.trigger_evolution(&id("a1"), true).await.unwrap();
    assert!(h.service.cancel_evolution(&id("a1")).await.unwrap());

    h.open_gate();
    let history = h.wait_for_history("a1", 1).await;
    assert_eq!(history[0].outcome, AttemptOutcome::RolledBack);
    assert_eq!(history[0].reason.as_ref().map(|r| r.code()), Some("cancelled"));
    let agent = h.service.get_agent(&id("a1")).await.unwrap();
    assert_eq!(agent.generation, 0);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_periodic_scan_triggers_low_scoring_agents() {
    let h = Harness::new(2, 8, &["a1", "a2"]).await;
    h.service.record_performance(&id("a2"), 0.95).await.unwrap();
    h.open_gate();

    h.service.evaluate_all().await;

    let history = h.wait_for_history("a1", 1).await;
    assert_eq!(history[0].trigger, evolve_core::TriggerReason::PerformanceThreshold);
    h.service.shutdown().await;
    assert!(h
        .service
        .get_evolution_history(&id("a2"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_manual_trigger_racing_a_finishing_attempt_sees_fresh_status() {
    let store = Arc::new(StallingStore::new());
    let h = Harness::with_store(2, 8, &["a1"], store.clone()).await;

    h.service.trigger_evolution(&id("a1"), false).await.unwrap();
    h.next_started().await;

    // The trigger reads a1 while it is still Analyzing, then stalls until
    // that attempt has finished and released its lease.
    store.arm();
    let a1 = id("a1");
    let (outcome, ()) = tokio::join!(h.service.trigger_evolution(&a1, true), async {
        store.stalled.notified().await;
        h.open_gate();
        h.wait_for_history("a1", 1).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.service.is_evolving(&id("a1")) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.resume.add_permits(1);
    });

    let outcome = outcome.unwrap();
    assert!(
        matches!(outcome, TriggerOutcome::Accepted { .. }),
        "got {outcome:?}"
    );
    let history = h.wait_for_history("a1", 2).await;
    assert_eq!(history[1].id, outcome.attempt_id().unwrap());
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_deferred_trigger_dropped_at_shutdown_is_recorded() {
    let h = Harness::new(2, 8, &["a1"]).await;

    h.service.trigger_evolution(&id("a1"), false).await.unwrap();
    h.next_started().await;
    let deferred = h.service.trigger_evolution(&id("a1"), true).await.unwrap();
    assert!(matches!(deferred, TriggerOutcome::Deferred { .. }));

    // Shutdown closes the queue before the running attempt can hand off.
    tokio::join!(h.service.shutdown(), async { h.open_gate() });

    let history = h.wait_for_history("a1", 2).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].id, deferred.attempt_id().unwrap());
    assert_eq!(history[1].outcome, AttemptOutcome::Failed);
    assert_eq!(history[1].reason.as_ref().map(|r| r.code()), Some("aborted"));
    assert!(!h.service.is_evolving(&id("a1")));
    let agent = h.service.get_agent(&id("a1")).await.unwrap();
    assert!(agent.status.is_idle());
}
