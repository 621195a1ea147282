//! Capability registry: registration, contract checks and isolated execution.
//!
//! Every invocation runs on its own tokio task under a hard wall-clock
//! timeout. The registry never retries; failures carry a
//! [`FailureClass`](crate::domain::FailureClass) so callers can decide.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use super::audit::{AuditLog, AuditRecord};
use super::descriptor::{CapabilityDescriptor, EffectiveLimits, InvocationBudget};
use super::error::{RegistryError, RegistryResult};
use super::handler::{CapabilityFault, CapabilityHandler};
use crate::config::EvolutionConfig;
use crate::domain::{digest::params_digest, AgentId, FailureClass};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Clone)]
struct Registered {
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn CapabilityHandler>,
}

#[derive(Debug, Clone, Default)]
struct Usage {
    invocations: u64,
    successes: u64,
    last_used: Option<DateTime<Utc>>,
}

impl Usage {
    fn count(&mut self, succeeded: bool, at: DateTime<Utc>) {
        self.invocations += 1;
        if succeeded {
            self.successes += 1;
        }
        self.last_used = Some(at);
    }
}

/// Usage statistics for one capability name, across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityStats {
    pub name: String,
    pub category: String,
    pub version: u32,
    pub usage_count: u64,
    /// 1.0 until the capability has been used.
    pub success_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl CapabilityStats {
    fn from_usage(descriptor: CapabilityDescriptor, usage: &Usage) -> Self {
        let success_rate = if usage.invocations == 0 {
            1.0
        } else {
            usage.successes as f64 / usage.invocations as f64
        };
        Self {
            name: descriptor.name,
            category: descriptor.category,
            version: descriptor.version,
            usage_count: usage.invocations,
            success_rate,
            last_used: usage.last_used,
        }
    }
}

pub struct CapabilityRegistry {
    entries: RwLock<BTreeMap<String, BTreeMap<u32, Registered>>>,
    usage: Mutex<HashMap<String, Usage>>,
    agent_usage: Mutex<HashMap<AgentId, HashMap<String, Usage>>>,
    audit: AuditLog,
    default_timeout: Duration,
    default_memory_bytes: u64,
}

impl CapabilityRegistry {
    pub fn new(default_timeout: Duration, default_memory_bytes: u64, audit_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            usage: Mutex::new(HashMap::new()),
            agent_usage: Mutex::new(HashMap::new()),
            audit: AuditLog::new(audit_capacity),
            default_timeout,
            default_memory_bytes,
        }
    }

    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self::new(
            config.capability_timeout_default(),
            config.capability_memory_default_bytes,
            config.audit_log_capacity,
        )
    }

    /// Add a capability version, or replace the handler of an identical one.
    ///
    /// A registered version is immutable: re-registering it with any
    /// difference in the descriptor (contract, limits, description or
    /// category) is a `Conflict`. Changes need a new version.
    pub fn register(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn CapabilityHandler>,
    ) -> RegistryResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let versions = entries.entry(descriptor.name.clone()).or_default();
        if let Some(existing) = versions.get_mut(&descriptor.version) {
            if existing.descriptor != descriptor {
                return Err(RegistryError::Conflict {
                    name: descriptor.name,
                    version: descriptor.version,
                });
            }
            existing.handler = handler;
            tracing::debug!(capability = %descriptor.name, version = descriptor.version, "capability handler replaced");
            return Ok(());
        }
        tracing::debug!(capability = %descriptor.name, version = descriptor.version, "capability registered");
        versions.insert(
            descriptor.version,
            Registered {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    /// Remove every version of `name`. Usage counters and audit records
    /// are kept; the name resolves to `NotFound` from now on.
    pub fn unregister(&self, name: &str) -> RegistryResult<CapabilityDescriptor> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let versions = entries
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string() })?;
        let latest = versions
            .into_values()
            .next_back()
            .map(|r| r.descriptor)
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string() })?;
        tracing::info!(capability = %name, "capability unregistered");
        Ok(latest)
    }

    fn latest(&self, name: &str) -> Option<Registered> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.latest(name).is_some()
    }

    /// Latest registered version of `name`.
    pub fn descriptor(&self, name: &str) -> RegistryResult<CapabilityDescriptor> {
        self.latest(name)
            .map(|r| r.descriptor)
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string() })
    }

    /// Latest version of every capability, ordered by name.
    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter_map(|versions| versions.values().next_back())
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn list_by_category(&self, category: &str) -> Vec<CapabilityDescriptor> {
        self.list()
            .into_iter()
            .filter(|d| d.category == category)
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .map(|d| d.category)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn stats(&self, name: &str) -> RegistryResult<CapabilityStats> {
        let descriptor = self.descriptor(name)?;
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let usage = usage.get(name).cloned().unwrap_or_default();
        Ok(CapabilityStats::from_usage(descriptor, &usage))
    }

    /// Per-capability statistics for invocations attributed to `agent_id`,
    /// ordered by name. Capabilities that are no longer registered are left out.
    pub fn agent_stats(&self, agent_id: &AgentId) -> Vec<CapabilityStats> {
        let used: Vec<(String, Usage)> = {
            let agent_usage = self.agent_usage.lock().unwrap_or_else(|e| e.into_inner());
            agent_usage
                .get(agent_id)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };
        let mut stats: Vec<CapabilityStats> = used
            .into_iter()
            .filter_map(|(name, usage)| {
                self.latest(&name)
                    .map(|r| CapabilityStats::from_usage(r.descriptor, &usage))
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Audit records, oldest first.
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit.snapshot()
    }

    /// Validate `params`, run the capability in isolation and return its output.
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        budget: Option<InvocationBudget>,
    ) -> RegistryResult<Value> {
        self.invoke_with(None, name, params, budget).await
    }

    /// Like [`invoke`](Self::invoke), attributing the call to `agent_id` in
    /// the audit log and per-agent statistics.
    pub async fn invoke_as(
        &self,
        agent_id: &AgentId,
        name: &str,
        params: Value,
        budget: Option<InvocationBudget>,
    ) -> RegistryResult<Value> {
        self.invoke_with(Some(agent_id), name, params, budget).await
    }

    #[instrument(skip_all, fields(capability = %name))]
    async fn invoke_with(
        &self,
        agent_id: Option<&AgentId>,
        name: &str,
        params: Value,
        budget: Option<InvocationBudget>,
    ) -> RegistryResult<Value> {
        let started = Instant::now();
        let digest = params_digest(&params);

        let (result, version) = match self.latest(name) {
            Some(registered) => {
                let version = registered.descriptor.version;
                (self.execute(registered, params, budget.as_ref()).await, Some(version))
            }
            None => (
                Err(RegistryError::NotFound {
                    name: name.to_string(),
                }),
                None,
            ),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.record(agent_id, name, version, digest, duration_ms, &result);
        result
    }

    async fn execute(
        &self,
        registered: Registered,
        params: Value,
        budget: Option<&InvocationBudget>,
    ) -> RegistryResult<Value> {
        let descriptor = registered.descriptor;
        let name = descriptor.name.clone();

        let validated = descriptor
            .input
            .validate_input(&params)
            .map_err(|reason| RegistryError::ContractViolation {
                name: name.clone(),
                reason,
            })?;

        let limits = EffectiveLimits::resolve(
            &descriptor.limits,
            budget,
            self.default_timeout,
            self.default_memory_bytes,
        );

        let handler = registered.handler;
        let mut task = tokio::spawn(async move { handler.call(validated, limits).await });

        let joined = match tokio::time::timeout(limits.max_duration, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(RegistryError::Timeout {
                    name,
                    limit_ms: limits.max_duration.as_millis() as u64,
                });
            }
        };

        let output = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(CapabilityFault::Internal { message, transient })) => {
                let class = if transient {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                };
                return Err(RegistryError::Execution {
                    name,
                    class,
                    cause: message,
                });
            }
            Ok(Err(CapabilityFault::ResourceExceeded { detail })) => {
                return Err(RegistryError::ResourceExceeded { name, detail });
            }
            Err(join_err) => {
                let cause = if join_err.is_panic() {
                    format!("capability panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    join_err.to_string()
                };
                return Err(RegistryError::Execution {
                    name,
                    class: FailureClass::Permanent,
                    cause,
                });
            }
        };

        let size = serde_json::to_vec(&output)
            .map(|bytes| bytes.len() as u64)
            .map_err(|e| RegistryError::Execution {
                name: name.clone(),
                class: FailureClass::Permanent,
                cause: format!("unserializable output: {e}"),
            })?;
        if size > limits.max_memory_bytes {
            return Err(RegistryError::ResourceExceeded {
                name,
                detail: format!("output of {size} bytes exceeds {} byte limit", limits.max_memory_bytes),
            });
        }

        if let Some(contract) = &descriptor.output {
            contract
                .check_output(&output)
                .map_err(|reason| RegistryError::Execution {
                    name: name.clone(),
                    class: FailureClass::Permanent,
                    cause: format!("output contract violation: {reason}"),
                })?;
        }

        Ok(output)
    }

    fn record(
        &self,
        agent_id: Option<&AgentId>,
        name: &str,
        version: Option<u32>,
        params_digest: String,
        duration_ms: u64,
        result: &RegistryResult<Value>,
    ) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(err) => err.code(),
        };

        METRICS.inc_capability_invocations();
        if result.is_err() {
            METRICS.inc_capability_failures();
        }
        obs::emit_capability_invoked(name, &params_digest, duration_ms, outcome);

        let now = Utc::now();
        if version.is_some() {
            let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
            usage.entry(name.to_string()).or_default().count(result.is_ok(), now);
            if let Some(agent_id) = agent_id {
                let mut agent_usage = self.agent_usage.lock().unwrap_or_else(|e| e.into_inner());
                agent_usage
                    .entry(agent_id.clone())
                    .or_default()
                    .entry(name.to_string())
                    .or_default()
                    .count(result.is_ok(), now);
            }
        }

        self.audit.record(AuditRecord {
            agent_id: agent_id.cloned(),
            name: name.to_string(),
            version,
            params_digest,
            duration_ms,
            outcome: outcome.to_string(),
            at: now,
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
