//! Capability descriptors and resource budgets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::contract::Contract;

/// Per-capability resource ceilings. `None` defers to the registry default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
}

/// Immutable description of one capability version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub input: Contract,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Contract>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

fn default_category() -> String {
    "general".to_string()
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            category: default_category(),
            input: Contract::new(),
            output: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn input(mut self, contract: Contract) -> Self {
        self.input = contract;
        self
    }

    pub fn output(mut self, contract: Contract) -> Self {
        self.output = Some(contract);
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.limits.max_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn max_memory_bytes(mut self, bytes: u64) -> Self {
        self.limits.max_memory_bytes = Some(bytes);
        self
    }
}

/// Caller-supplied ceiling for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationBudget {
    pub max_duration: Option<Duration>,
    pub max_memory_bytes: Option<u64>,
}

impl InvocationBudget {
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            max_duration: Some(duration),
            max_memory_bytes: None,
        }
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }
}

/// Limits actually enforced for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub max_duration: Duration,
    pub max_memory_bytes: u64,
}

impl EffectiveLimits {
    /// Intersect descriptor limits with the caller budget; fall back to the
    /// registry defaults where neither side sets a ceiling.
    pub fn resolve(
        limits: &ResourceLimits,
        budget: Option<&InvocationBudget>,
        default_duration: Duration,
        default_memory: u64,
    ) -> Self {
        let descriptor_duration = limits.max_duration_ms.map(Duration::from_millis);
        let budget_duration = budget.and_then(|b| b.max_duration);
        let max_duration = min_opt(descriptor_duration, budget_duration).unwrap_or(default_duration);

        let budget_memory = budget.and_then(|b| b.max_memory_bytes);
        let max_memory_bytes = min_opt(limits.max_memory_bytes, budget_memory).unwrap_or(default_memory);

        Self {
            max_duration,
            max_memory_bytes,
        }
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_MEM: u64 = 1024;

    #[test]
    fn budget_tightens_descriptor_limit() {
        let limits = ResourceLimits {
            max_duration_ms: Some(10_000),
            max_memory_bytes: Some(4096),
        };
        let budget = InvocationBudget::with_duration(Duration::from_secs(5)).with_memory(8192);
        let eff = EffectiveLimits::resolve(&limits, Some(&budget), Duration::from_secs(30), DEFAULT_MEM);
        assert_eq!(eff.max_duration, Duration::from_secs(5));
        assert_eq!(eff.max_memory_bytes, 4096);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let eff = EffectiveLimits::resolve(
            &ResourceLimits::default(),
            None,
            Duration::from_secs(30),
            DEFAULT_MEM,
        );
        assert_eq!(eff.max_duration, Duration::from_secs(30));
        assert_eq!(eff.max_memory_bytes, DEFAULT_MEM);
    }
}
