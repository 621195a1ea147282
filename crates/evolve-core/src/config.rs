//! Evolution configuration.
//!
//! Resolution order: defaults, then the TOML file (if present), then
//! `EVOLVE_*` environment variables, then [`EvolutionConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{EvolutionError, EvolutionStrategy, Result};

/// Knowledge relevance ranking algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMode {
    #[default]
    Keyword,
    Cosine,
}

impl std::str::FromStr for RankingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(RankingMode::Keyword),
            "cosine" => Ok(RankingMode::Cosine),
            other => Err(format!("unknown ranking mode: {other}")),
        }
    }
}

fn default_ideal_capabilities() -> Vec<String> {
    [
        "data_analysis",
        "report_generation",
        "task_automation",
        "predictive_modeling",
        "natural_language_processing",
        "decision_support",
        "workflow_optimization",
        "anomaly_detection",
        "customer_insights",
        "financial_analysis",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// All recognized tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Minimum time between committed evolutions before an automatic trigger fires.
    pub min_evolution_interval_secs: u64,
    /// Automatic triggers fire when the latest score is below this.
    pub performance_threshold: f64,
    /// Roll back when projected < best - tolerance.
    pub regression_guard_tolerance: f64,
    /// Roll back when projected < current - tolerance.
    pub commit_tolerance: f64,
    pub knowledge_capacity_per_agent: usize,
    pub auto_create_namespaces: bool,
    pub worker_pool_size: usize,
    pub trigger_queue_capacity: usize,
    pub capability_timeout_default_ms: u64,
    pub capability_memory_default_bytes: u64,
    /// Retries after the first transient failure of a stage.
    pub transient_retry_limit: u32,
    pub retry_backoff_base_ms: u64,
    pub research_top_k: usize,
    pub scan_interval_secs: u64,
    pub ranking: RankingMode,
    pub audit_log_capacity: usize,
    /// Scores considered by the analyzer's trend computation.
    pub recent_window: usize,
    pub ideal_capabilities: Vec<String>,
    pub default_strategy: EvolutionStrategy,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            min_evolution_interval_secs: 3600,
            performance_threshold: 0.7,
            regression_guard_tolerance: 0.05,
            commit_tolerance: 0.0,
            knowledge_capacity_per_agent: 10_000,
            auto_create_namespaces: true,
            worker_pool_size: 4,
            trigger_queue_capacity: 64,
            capability_timeout_default_ms: 30_000,
            capability_memory_default_bytes: 16 * 1024 * 1024,
            transient_retry_limit: 2,
            retry_backoff_base_ms: 200,
            research_top_k: 10,
            scan_interval_secs: 300,
            ranking: RankingMode::Keyword,
            audit_log_capacity: 1024,
            recent_window: 5,
            ideal_capabilities: default_ideal_capabilities(),
            default_strategy: EvolutionStrategy::Incremental,
        }
    }
}

fn invalid(msg: impl Into<String>) -> EvolutionError {
    EvolutionError::InvalidConfig(msg.into())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(format!("{key}={raw}: {e}")))
}

impl EvolutionConfig {
    /// Load from `path` (defaults when absent), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| invalid(format!("reading {}: {e}", p.display())))?;
                Self::from_toml_str(&raw)?
            }
            Some(p) => {
                tracing::debug!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_with(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| invalid(format!("parse error: {e}")))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| invalid(format!("serialize error: {e}")))
    }

    /// Apply `EVOLVE_<FIELD>` overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! env_override {
            ($($field:ident => $key:literal),* $(,)?) => {
                $(
                    if let Some(raw) = lookup($key) {
                        self.$field = parse_env($key, &raw)?;
                    }
                )*
            };
        }

        env_override!(
            min_evolution_interval_secs => "EVOLVE_MIN_EVOLUTION_INTERVAL_SECS",
            performance_threshold => "EVOLVE_PERFORMANCE_THRESHOLD",
            regression_guard_tolerance => "EVOLVE_REGRESSION_GUARD_TOLERANCE",
            commit_tolerance => "EVOLVE_COMMIT_TOLERANCE",
            knowledge_capacity_per_agent => "EVOLVE_KNOWLEDGE_CAPACITY_PER_AGENT",
            auto_create_namespaces => "EVOLVE_AUTO_CREATE_NAMESPACES",
            worker_pool_size => "EVOLVE_WORKER_POOL_SIZE",
            trigger_queue_capacity => "EVOLVE_TRIGGER_QUEUE_CAPACITY",
            capability_timeout_default_ms => "EVOLVE_CAPABILITY_TIMEOUT_DEFAULT_MS",
            capability_memory_default_bytes => "EVOLVE_CAPABILITY_MEMORY_DEFAULT_BYTES",
            transient_retry_limit => "EVOLVE_TRANSIENT_RETRY_LIMIT",
            retry_backoff_base_ms => "EVOLVE_RETRY_BACKOFF_BASE_MS",
            research_top_k => "EVOLVE_RESEARCH_TOP_K",
            scan_interval_secs => "EVOLVE_SCAN_INTERVAL_SECS",
            ranking => "EVOLVE_RANKING",
            audit_log_capacity => "EVOLVE_AUDIT_LOG_CAPACITY",
            recent_window => "EVOLVE_RECENT_WINDOW",
            default_strategy => "EVOLVE_DEFAULT_STRATEGY",
        );

        if let Some(raw) = lookup("EVOLVE_IDEAL_CAPABILITIES") {
            self.ideal_capabilities = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.performance_threshold) {
            return Err(invalid("performance_threshold must be within 0.0..=1.0"));
        }
        if self.regression_guard_tolerance < 0.0 || !self.regression_guard_tolerance.is_finite() {
            return Err(invalid("regression_guard_tolerance must be a non-negative number"));
        }
        if self.commit_tolerance < 0.0 || !self.commit_tolerance.is_finite() {
            return Err(invalid("commit_tolerance must be a non-negative number"));
        }
        if self.knowledge_capacity_per_agent == 0 {
            return Err(invalid("knowledge_capacity_per_agent must be at least 1"));
        }
        if self.worker_pool_size == 0 {
            return Err(invalid("worker_pool_size must be at least 1"));
        }
        if self.trigger_queue_capacity == 0 {
            return Err(invalid("trigger_queue_capacity must be at least 1"));
        }
        if self.capability_timeout_default_ms == 0 {
            return Err(invalid("capability_timeout_default_ms must be positive"));
        }
        if self.capability_memory_default_bytes == 0 {
            return Err(invalid("capability_memory_default_bytes must be positive"));
        }
        if self.research_top_k == 0 {
            return Err(invalid("research_top_k must be at least 1"));
        }
        if self.scan_interval_secs == 0 {
            return Err(invalid("scan_interval_secs must be positive"));
        }
        if self.audit_log_capacity == 0 {
            return Err(invalid("audit_log_capacity must be at least 1"));
        }
        if self.recent_window == 0 {
            return Err(invalid("recent_window must be at least 1"));
        }
        Ok(())
    }

    pub fn min_evolution_interval(&self) -> Duration {
        Duration::from_secs(self.min_evolution_interval_secs)
    }

    pub fn capability_timeout_default(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_default_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = EvolutionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.regression_guard_tolerance, 0.05);
        assert_eq!(config.commit_tolerance, 0.0);
        assert_eq!(config.ranking, RankingMode::Keyword);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EvolutionConfig::from_toml_str(
            r#"
            worker_pool_size = 8
            ranking = "cosine"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.ranking, RankingMode::Cosine);
        assert_eq!(config.trigger_queue_capacity, 64);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = EvolutionConfig::default();
        let env: HashMap<&str, &str> = [
            ("EVOLVE_TRANSIENT_RETRY_LIMIT", "5"),
            ("EVOLVE_RANKING", "cosine"),
            ("EVOLVE_IDEAL_CAPABILITIES", "a, b,,c"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_with(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.transient_retry_limit, 5);
        assert_eq!(config.ranking, RankingMode::Cosine);
        assert_eq!(config.ideal_capabilities, vec!["a", "b", "c"]);
    }

    #[test]
    fn bad_env_value_is_invalid_config() {
        let mut config = EvolutionConfig::default();
        let err = config
            .apply_env_with(|k| (k == "EVOLVE_WORKER_POOL_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidConfig(_)));
        assert!(err.to_string().contains("EVOLVE_WORKER_POOL_SIZE"));
    }

    #[test]
    fn validate_rejects_zero_pool() {
        let config = EvolutionConfig {
            worker_pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_threshold_out_of_range() {
        let config = EvolutionConfig {
            performance_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "knowledge_capacity_per_agent = 3").unwrap();
        writeln!(file, "scan_interval_secs = 10").unwrap();

        let config = EvolutionConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.knowledge_capacity_per_agent, 3);
        assert_eq!(config.scan_interval(), Duration::from_secs(10));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EvolutionConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.worker_pool_size, 4);
    }

    #[test]
    fn toml_round_trip() {
        let config = EvolutionConfig::default();
        let raw = config.to_toml_string().unwrap();
        assert_eq!(EvolutionConfig::from_toml_str(&raw).unwrap(), config);
    }
}
