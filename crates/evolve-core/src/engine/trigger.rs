//! Trigger eligibility.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EvolutionConfig;
use crate::domain::{AgentRecord, AgentStatus, TriggerReason};

/// Why an agent may not evolve right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Ineligible {
    NotIdle { status: AgentStatus },
    IntervalNotElapsed { remaining_secs: u64 },
    NoScores,
    ScoreAboveThreshold { latest: f64, threshold: f64 },
}

impl Ineligible {
    pub fn code(&self) -> &'static str {
        match self {
            Ineligible::NotIdle { .. } => "not_idle",
            Ineligible::IntervalNotElapsed { .. } => "interval_not_elapsed",
            Ineligible::NoScores => "no_scores",
            Ineligible::ScoreAboveThreshold { .. } => "score_above_threshold",
        }
    }
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligible::NotIdle { status } => write!(f, "agent is {status}"),
            Ineligible::IntervalNotElapsed { remaining_secs } => {
                write!(f, "minimum evolution interval has {remaining_secs}s left")
            }
            Ineligible::NoScores => write!(f, "no performance scores recorded"),
            Ineligible::ScoreAboveThreshold { latest, threshold } => {
                write!(f, "latest score {latest} is not below threshold {threshold}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerPolicy {
    pub min_interval: Duration,
    pub threshold: f64,
}

impl TriggerPolicy {
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            min_interval: config.min_evolution_interval(),
            threshold: config.performance_threshold,
        }
    }

    /// Manual triggers skip the interval and score checks, never the idle check.
    pub fn check(
        &self,
        agent: &AgentRecord,
        reason: TriggerReason,
        now: DateTime<Utc>,
    ) -> Result<(), Ineligible> {
        if !agent.status.is_idle() {
            return Err(Ineligible::NotIdle {
                status: agent.status,
            });
        }
        if reason.is_manual() {
            return Ok(());
        }

        if let Some(last) = agent.last_evolved {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.min_interval {
                return Err(Ineligible::IntervalNotElapsed {
                    remaining_secs: (self.min_interval - elapsed).as_secs(),
                });
            }
        }

        let latest = agent.latest_score().ok_or(Ineligible::NoScores)?;
        if latest >= self.threshold {
            return Err(Ineligible::ScoreAboveThreshold {
                latest,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}
