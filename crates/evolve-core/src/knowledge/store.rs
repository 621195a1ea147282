//! Per-agent, capacity-bounded knowledge store.
//!
//! Each agent owns a namespace guarded by its own async mutex, so puts for
//! one agent serialize while different agents proceed in parallel. When a
//! durable backend is attached, every put writes through to it before the
//! in-memory namespace changes; a backend failure leaves both sides as they
//! were.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use evolve_state::DocumentStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::entry::{EntryId, KnowledgeEntry, KnowledgeFilter, KnowledgeKind};
use super::error::{KnowledgeError, KnowledgeResult};
use super::ranking::{ranker_for, RankQuery, RelevanceRanker};
use crate::config::EvolutionConfig;
use crate::domain::AgentId;
use crate::metrics::METRICS;

#[derive(Debug, Default)]
struct Namespace {
    entries: HashMap<EntryId, KnowledgeEntry>,
}

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub stored: EntryId,
    /// Entries removed to get back within capacity. May include `stored`
    /// itself when the incoming entry ranked lowest.
    pub evicted: Vec<EntryId>,
}

impl PutOutcome {
    pub fn was_retained(&self) -> bool {
        !self.evicted.contains(&self.stored)
    }
}

/// Namespace statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub agent_id: AgentId,
    pub entry_count: usize,
    pub capacity: usize,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub knowledge_domains: usize,
    pub pattern_types: usize,
}

/// Lowest relevance first, then oldest, then id.
fn eviction_order(a: &KnowledgeEntry, b: &KnowledgeEntry) -> Ordering {
    a.relevance
        .total_cmp(&b.relevance)
        .then(a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(&b.id))
}

fn collection(agent_id: &AgentId) -> String {
    format!("knowledge:{agent_id}")
}

pub struct KnowledgeStore {
    namespaces: RwLock<HashMap<AgentId, Arc<Mutex<Namespace>>>>,
    capacity: usize,
    auto_create: bool,
    ranker: Arc<dyn RelevanceRanker>,
    backend: Option<Arc<dyn DocumentStore>>,
}

impl KnowledgeStore {
    pub fn new(capacity: usize, auto_create: bool, ranker: Arc<dyn RelevanceRanker>) -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            auto_create,
            ranker,
            backend: None,
        }
    }

    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self::new(
            config.knowledge_capacity_per_agent,
            config.auto_create_namespaces,
            ranker_for(config.ranking),
        )
    }

    /// Attach a durable backend; subsequent writes go through it.
    pub fn with_backend(mut self, backend: Arc<dyn DocumentStore>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ranker_name(&self) -> &'static str {
        self.ranker.name()
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    fn lookup(&self, agent_id: &AgentId) -> Option<Arc<Mutex<Namespace>>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    fn namespace(&self, agent_id: &AgentId, create: bool) -> KnowledgeResult<Arc<Mutex<Namespace>>> {
        if let Some(ns) = self.lookup(agent_id) {
            return Ok(ns);
        }
        if !create {
            return Err(KnowledgeError::NamespaceNotFound(agent_id.clone()));
        }
        let mut map = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Namespace::default())))
            .clone())
    }

    /// Create an empty namespace for `agent_id` if none exists.
    pub fn ensure_namespace(&self, agent_id: &AgentId) {
        // create = true never fails
        let _ = self.namespace(agent_id, true);
    }

    pub fn has_namespace(&self, agent_id: &AgentId) -> bool {
        self.lookup(agent_id).is_some()
    }

    /// Insert or update an entry, evicting until the namespace is back at capacity.
    ///
    /// Updating an existing id requires a strictly higher `version`.
    #[instrument(skip_all, fields(agent_id = %agent_id, entry_id = %entry.id))]
    pub async fn put(&self, agent_id: &AgentId, mut entry: KnowledgeEntry) -> KnowledgeResult<PutOutcome> {
        let ns = self.namespace(agent_id, self.auto_create)?;
        let mut ns = ns.lock().await;
        entry.agent_id = agent_id.clone();

        let previous_access = match ns.entries.get(&entry.id) {
            Some(prev) if entry.version <= prev.version => {
                return Err(KnowledgeError::StaleWrite {
                    entry_id: entry.id.clone(),
                    stored: prev.version,
                    attempted: entry.version,
                });
            }
            Some(prev) => Some(prev.access_count),
            None => None,
        };
        if let Some(count) = previous_access {
            entry.access_count = entry.access_count.max(count);
        }

        let projected = ns.entries.len() + usize::from(previous_access.is_none());
        let excess = projected.saturating_sub(self.capacity);
        let victims: Vec<EntryId> = if excess == 0 {
            Vec::new()
        } else {
            let mut pool: Vec<&KnowledgeEntry> =
                ns.entries.values().filter(|e| e.id != entry.id).collect();
            pool.push(&entry);
            pool.sort_by(|a, b| eviction_order(a, b));
            pool.into_iter().take(excess).map(|e| e.id.clone()).collect()
        };
        let incoming_evicted = victims.contains(&entry.id);

        if let Some(backend) = &self.backend {
            let removed: Vec<KnowledgeEntry> = victims
                .iter()
                .filter_map(|id| ns.entries.get(id).cloned())
                .collect();
            let stored = (!incoming_evicted).then_some(&entry);
            write_through(backend.as_ref(), &collection(agent_id), stored, &removed).await?;
        }

        for id in &victims {
            ns.entries.remove(id);
        }
        let stored = entry.id.clone();
        if !incoming_evicted {
            ns.entries.insert(stored.clone(), entry);
        }

        if !victims.is_empty() {
            METRICS.add_knowledge_evictions(victims.len() as u64);
            debug!(evicted = victims.len(), "knowledge namespace at capacity");
        }

        Ok(PutOutcome {
            stored,
            evicted: victims,
        })
    }

    /// Top `top_k` entries ranked against `key`.
    pub async fn query(&self, agent_id: &AgentId, key: &str, top_k: usize) -> KnowledgeResult<KnowledgeQuery> {
        self.query_with(agent_id, RankQuery::new(key), top_k, None).await
    }

    /// Like [`query`](Self::query) restricted to entries matching `filter`.
    pub async fn query_filtered(
        &self,
        agent_id: &AgentId,
        key: &str,
        top_k: usize,
        filter: &KnowledgeFilter,
    ) -> KnowledgeResult<KnowledgeQuery> {
        self.query_with(agent_id, RankQuery::new(key), top_k, Some(filter))
            .await
    }

    pub async fn query_with(
        &self,
        agent_id: &AgentId,
        query: RankQuery,
        top_k: usize,
        filter: Option<&KnowledgeFilter>,
    ) -> KnowledgeResult<KnowledgeQuery> {
        let entries = match self.lookup(agent_id) {
            Some(ns) => {
                let ns = ns.lock().await;
                ns.entries
                    .values()
                    .filter(|e| filter.map_or(true, |f| f.matches(e)))
                    .cloned()
                    .collect()
            }
            None if self.auto_create => Vec::new(),
            None => return Err(KnowledgeError::NamespaceNotFound(agent_id.clone())),
        };

        Ok(KnowledgeQuery {
            entries,
            query,
            top_k,
            ranker: self.ranker.clone(),
        })
    }

    /// Fetch one entry and count the access.
    pub async fn get(&self, agent_id: &AgentId, entry_id: &EntryId) -> KnowledgeResult<KnowledgeEntry> {
        let ns = self.namespace(agent_id, false)?;
        let mut ns = ns.lock().await;
        let entry = ns
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| KnowledgeError::EntryNotFound {
                agent_id: agent_id.clone(),
                entry_id: entry_id.clone(),
            })?;
        entry.access_count += 1;
        Ok(entry.clone())
    }

    /// Remove every entry for `agent_id`. Idempotent; returns the number removed.
    #[instrument(skip_all, fields(agent_id = %agent_id))]
    pub async fn delete(&self, agent_id: &AgentId) -> KnowledgeResult<usize> {
        let removed = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);

        let mut count = 0;
        if let Some(ns) = removed {
            // Wait out any put still holding the namespace.
            count = ns.lock().await.entries.len();
        }
        if let Some(backend) = &self.backend {
            count = count.max(backend.clear(&collection(agent_id)).await?);
        }
        Ok(count)
    }

    pub async fn stats(&self, agent_id: &AgentId) -> KnowledgeResult<MemoryStats> {
        let ns = match self.lookup(agent_id) {
            Some(ns) => ns,
            None if self.auto_create => {
                return Ok(MemoryStats {
                    agent_id: agent_id.clone(),
                    entry_count: 0,
                    capacity: self.capacity,
                    oldest_timestamp: None,
                    knowledge_domains: 0,
                    pattern_types: 0,
                })
            }
            None => return Err(KnowledgeError::NamespaceNotFound(agent_id.clone())),
        };
        let ns = ns.lock().await;

        let mut domains = HashSet::new();
        let mut patterns = HashSet::new();
        for entry in ns.entries.values() {
            match &entry.kind {
                KnowledgeKind::Knowledge { domain } => {
                    domains.insert(domain.as_str());
                }
                KnowledgeKind::Pattern { pattern_type } => {
                    patterns.insert(pattern_type.as_str());
                }
                KnowledgeKind::Experience => {}
            }
        }

        Ok(MemoryStats {
            agent_id: agent_id.clone(),
            entry_count: ns.entries.len(),
            capacity: self.capacity,
            oldest_timestamp: ns.entries.values().map(|e| e.timestamp).min(),
            knowledge_domains: domains.len(),
            pattern_types: patterns.len(),
        })
    }

    /// Replace the in-memory namespace with the backend's contents.
    ///
    /// Entries beyond capacity (e.g. after the capacity was lowered) are
    /// evicted from both sides.
    pub async fn load_from_backend(&self, agent_id: &AgentId) -> KnowledgeResult<usize> {
        let backend = self.backend.clone().ok_or(KnowledgeError::NoBackend)?;
        let coll = collection(agent_id);
        let docs = backend.list(&coll).await?;

        let mut loaded: Vec<KnowledgeEntry> = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.decode::<KnowledgeEntry>() {
                Ok(entry) => loaded.push(entry),
                Err(e) => warn!(key = %doc.key, error = %e, "skipping undecodable knowledge entry"),
            }
        }

        loaded.sort_by(|a, b| eviction_order(b, a));
        let overflow: Vec<KnowledgeEntry> = if loaded.len() > self.capacity {
            loaded.split_off(self.capacity)
        } else {
            Vec::new()
        };
        for entry in &overflow {
            backend.delete(&coll, entry.id.as_str()).await?;
        }

        let ns = self.namespace(agent_id, true)?;
        let mut ns = ns.lock().await;
        ns.entries = loaded.into_iter().map(|e| (e.id.clone(), e)).collect();
        debug!(agent_id = %agent_id, loaded = ns.entries.len(), trimmed = overflow.len(), "knowledge namespace loaded");
        Ok(ns.entries.len())
    }
}

/// Delete `removed` and upsert `stored`, restoring deleted entries if a later step fails.
async fn write_through(
    backend: &dyn DocumentStore,
    coll: &str,
    stored: Option<&KnowledgeEntry>,
    removed: &[KnowledgeEntry],
) -> KnowledgeResult<()> {
    let body = stored.map(serde_json::to_value).transpose()?;

    let mut deleted: Vec<&KnowledgeEntry> = Vec::new();
    for victim in removed {
        if let Err(e) = backend.delete(coll, victim.id.as_str()).await {
            restore(backend, coll, &deleted).await;
            return Err(e.into());
        }
        deleted.push(victim);
    }

    if let (Some(entry), Some(body)) = (stored, body) {
        if let Err(e) = backend.upsert(coll, entry.id.as_str(), body).await {
            restore(backend, coll, &deleted).await;
            return Err(e.into());
        }
    }
    Ok(())
}

async fn restore(backend: &dyn DocumentStore, coll: &str, entries: &[&KnowledgeEntry]) {
    for entry in entries {
        let result = match serde_json::to_value(entry) {
            Ok(body) => backend.upsert(coll, entry.id.as_str(), body).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(entry_id = %entry.id, error = %e, "failed to restore evicted knowledge entry");
        }
    }
}

// ---------------------------------------------------------------------------
// Lazy ranked query
// ---------------------------------------------------------------------------

/// A ranked query over a snapshot of one namespace.
///
/// Nothing is scored until [`iter`](Self::iter) is called, and every call
/// starts a fresh ranking, so the query can be consumed any number of times.
pub struct KnowledgeQuery {
    entries: Vec<KnowledgeEntry>,
    query: RankQuery,
    top_k: usize,
    ranker: Arc<dyn RelevanceRanker>,
}

/// An entry with its relevance score.
#[derive(Debug, Clone, Copy)]
pub struct ScoredEntry<'a> {
    pub score: f64,
    pub entry: &'a KnowledgeEntry,
}

struct Ranked<'a>(ScoredEntry<'a>);

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (&self.0, &other.0);
        a.score
            .total_cmp(&b.score)
            .then(a.entry.timestamp.cmp(&b.entry.timestamp))
            .then_with(|| b.entry.id.cmp(&a.entry.id))
    }
}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

impl KnowledgeQuery {
    /// Best-first iterator of at most `top_k` entries.
    ///
    /// Ties on score go to the most recent entry. With an empty key, entries
    /// rank by their stored relevance; otherwise entries the ranker scores
    /// at zero are left out.
    pub fn iter(&self) -> RankedIter<'_> {
        let heap = self
            .entries
            .iter()
            .filter_map(|entry| {
                let score = if self.query.is_empty() {
                    entry.relevance
                } else {
                    let s = self.ranker.score(&self.query, entry);
                    if s <= 0.0 {
                        return None;
                    }
                    s
                };
                Some(Ranked(ScoredEntry { score, entry }))
            })
            .collect();
        RankedIter {
            heap,
            remaining: self.top_k,
        }
    }

    /// Materialize the ranking.
    pub fn to_vec(&self) -> Vec<KnowledgeEntry> {
        self.iter().map(|s| s.entry.clone()).collect()
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Size of the snapshot being ranked (before scoring and `top_k`).
    pub fn candidate_count(&self) -> usize {
        self.entries.len()
    }
}

impl<'a> IntoIterator for &'a KnowledgeQuery {
    type Item = ScoredEntry<'a>;
    type IntoIter = RankedIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RankedIter<'a> {
    heap: BinaryHeap<Ranked<'a>>,
    remaining: usize,
}

impl<'a> Iterator for RankedIter<'a> {
    type Item = ScoredEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let next = self.heap.pop()?;
        self.remaining -= 1;
        Some(next.0)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.heap.len().min(self.remaining);
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::ranking::KeywordRanker;
    use chrono::Duration;
    use serde_json::json;

    fn store(capacity: usize) -> KnowledgeStore {
        KnowledgeStore::new(capacity, true, Arc::new(KeywordRanker))
    }

    fn exp(agent: &str, relevance: f64, terms: &[&str]) -> KnowledgeEntry {
        KnowledgeEntry::new(agent, KnowledgeKind::Experience, json!({}))
            .with_relevance(relevance)
            .with_key_terms(terms.iter().copied())
    }

    #[tokio::test]
    async fn eviction_prefers_low_relevance_then_oldest() {
        let s = store(2);
        let a1 = AgentId::from("a1");
        let now = Utc::now();

        let old_low = exp("a1", 0.2, &[]).with_timestamp(now - Duration::seconds(10));
        let new_low = exp("a1", 0.2, &[]).with_timestamp(now);
        let high = exp("a1", 0.9, &[]);
        let old_low_id = old_low.id.clone();

        s.put(&a1, old_low).await.unwrap();
        s.put(&a1, new_low.clone()).await.unwrap();
        let outcome = s.put(&a1, high).await.unwrap();

        assert_eq!(outcome.evicted, vec![old_low_id]);
        assert!(outcome.was_retained());
        assert_eq!(s.stats(&a1).await.unwrap().entry_count, 2);
    }

    #[tokio::test]
    async fn incoming_entry_can_be_its_own_victim() {
        let s = store(1);
        let a1 = AgentId::from("a1");
        s.put(&a1, exp("a1", 0.9, &[])).await.unwrap();

        let outcome = s.put(&a1, exp("a1", 0.1, &[])).await.unwrap();
        assert!(!outcome.was_retained());
        assert_eq!(s.stats(&a1).await.unwrap().entry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_never_exceed_capacity() {
        let s = Arc::new(store(5));
        let a1 = AgentId::from("a1");

        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let s = s.clone();
                let a1 = a1.clone();
                tokio::spawn(async move {
                    let relevance = (i % 10) as f64 / 10.0;
                    s.put(&a1, exp("a1", relevance, &["load"])).await.unwrap();
                    let count = s.stats(&a1).await.unwrap().entry_count;
                    assert!(count <= 5, "namespace grew to {count}");
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(s.stats(&a1).await.unwrap().entry_count, 5);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let s = store(10);
        let a1 = AgentId::from("a1");
        let entry = exp("a1", 0.5, &[]);
        s.put(&a1, entry.clone()).await.unwrap();

        let err = s.put(&a1, entry.clone()).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::StaleWrite { stored: 1, attempted: 1, .. }));

        s.put(&a1, entry.revised(json!({"v": 2}))).await.unwrap();
    }

    #[tokio::test]
    async fn query_is_restartable_and_bounded() {
        let s = store(10);
        let a1 = AgentId::from("a1");
        s.put(&a1, exp("a1", 0.5, &["caching", "latency"])).await.unwrap();
        s.put(&a1, exp("a1", 0.5, &["caching"])).await.unwrap();
        s.put(&a1, exp("a1", 0.5, &["reports"])).await.unwrap();

        let q = s.query(&a1, "caching latency", 5).await.unwrap();
        let first: Vec<f64> = q.iter().map(|r| r.score).collect();
        let second: Vec<f64> = q.iter().map(|r| r.score).collect();
        assert_eq!(first, vec![1.0, 0.5]);
        assert_eq!(first, second);

        let q = s.query(&a1, "caching", 1).await.unwrap();
        assert_eq!(q.iter().count(), 1);
    }

    #[tokio::test]
    async fn unknown_agent_without_auto_create_is_not_found() {
        let s = KnowledgeStore::new(10, false, Arc::new(KeywordRanker));
        let ghost = AgentId::from("ghost");
        assert!(matches!(
            s.put(&ghost, exp("ghost", 0.5, &[])).await,
            Err(KnowledgeError::NamespaceNotFound(_))
        ));
        assert!(s.query(&ghost, "x", 1).await.is_err());

        s.ensure_namespace(&ghost);
        s.put(&ghost, exp("ghost", 0.5, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn get_counts_accesses() {
        let s = store(10);
        let a1 = AgentId::from("a1");
        let entry = exp("a1", 0.5, &[]);
        let id = entry.id.clone();
        s.put(&a1, entry).await.unwrap();

        s.get(&a1, &id).await.unwrap();
        let e = s.get(&a1, &id).await.unwrap();
        assert_eq!(e.access_count, 2);
        assert!(matches!(
            s.get(&a1, &EntryId::from("nope")).await,
            Err(KnowledgeError::EntryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let s = store(10);
        let a1 = AgentId::from("a1");
        s.put(&a1, exp("a1", 0.5, &[])).await.unwrap();
        assert_eq!(s.delete(&a1).await.unwrap(), 1);
        assert_eq!(s.delete(&a1).await.unwrap(), 0);
        assert!(!s.has_namespace(&a1));
    }
}
