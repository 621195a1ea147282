//! Default stage executors: Analyzer, Researcher, Coder and Player.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::{StageError, StageResult};
use super::stage::{StageContext, StageExecutors};
use crate::domain::{
    rank_candidates, Candidate, CandidateSource, CapabilityConfig, CapabilityDelta, CapabilitySet,
    DeltaOp, ImprovementTarget, Stage, ValidationReport,
};
use crate::knowledge::{KnowledgeFilter, KnowledgeKind};
use crate::registry::EVALUATE_CAPABILITY_SET;

/// Knowledge domain under which committed strategies are remembered.
pub const STRATEGY_DOMAIN: &str = "evolution";

/// Capabilities scoring below this are retune candidates.
const RETUNE_BELOW: f64 = 0.8;
const RETUNE_CONFIDENCE: f64 = 0.8;
const GAP_GAIN: f64 = 0.05;
const GAP_CONFIDENCE: f64 = 0.7;

/// A remembered strategy: the shape Coder writes and Researcher reads back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyNote {
    pub change: DeltaOp,
    pub description: String,
    pub expected_gain: f64,
    pub confidence: f64,
}

/// Summarizes recent performance into an improvement target.
#[derive(Debug, Clone, Default)]
pub struct Analyzer;

impl Analyzer {
    pub fn analyze(&self, ctx: &StageContext) -> ImprovementTarget {
        let scores: Vec<f64> = ctx.agent.performance.iter().map(|s| s.score).collect();
        let window = ctx.settings.recent_window.max(1);
        let recent = &scores[scores.len().saturating_sub(window)..];

        let overall_score = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        };
        let trend = match (recent.first(), recent.last()) {
            (Some(first), Some(last)) if recent.len() > 1 => last - first,
            _ => 0.0,
        };

        let weak = ctx
            .agent
            .capabilities
            .0
            .iter()
            .filter_map(|(name, cfg)| cfg.score().map(|s| (name.clone(), s)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let ideal = &ctx.settings.ideal_capabilities;
        let missing_capabilities: Vec<String> = ideal
            .iter()
            .filter(|name| !ctx.agent.capabilities.contains(name))
            .cloned()
            .collect();

        let deficiency = match &weak {
            Some((name, score)) if *score < RETUNE_BELOW => {
                format!("capability {name} scores {score:.2}")
            }
            _ if trend < 0.0 => format!("performance declined by {:.2} over the recent window", -trend),
            _ if !missing_capabilities.is_empty() => format!(
                "missing {} of {} ideal capabilities",
                missing_capabilities.len(),
                ideal.len()
            ),
            _ => format!("overall score {overall_score:.2}"),
        };

        let mut recommendations = Vec::new();
        if overall_score < RETUNE_BELOW {
            recommendations.push("Consider major evolution to improve overall performance".to_string());
        }
        if !ideal.is_empty() {
            let coverage = 1.0 - missing_capabilities.len() as f64 / ideal.len() as f64;
            if coverage < 0.7 {
                recommendations.push("Expand capabilities to cover more business functions".to_string());
            }
        }
        if trend < -0.1 {
            recommendations.push("Investigate the recent performance decline".to_string());
        }
        if let Some((name, score)) = &weak {
            if *score < RETUNE_BELOW {
                recommendations.push(format!("Retune capability {name}"));
            }
        }

        ImprovementTarget {
            weak_capability: weak.map(|(name, _)| name),
            deficiency,
            overall_score,
            trend,
            missing_capabilities,
            recommendations,
        }
    }
}

/// Turns a target into ranked candidate changes.
#[derive(Debug, Clone, Default)]
pub struct Researcher {
    /// Optional external capability consulted for more candidates. It gets
    /// `{"agent_id", "target"}` and answers `{"candidates": [...]}`.
    pub research_capability: Option<String>,
}

impl Researcher {
    pub fn with_capability(name: impl Into<String>) -> Self {
        Self {
            research_capability: Some(name.into()),
        }
    }

    pub async fn research(
        &self,
        ctx: &StageContext,
        target: &ImprovementTarget,
    ) -> StageResult<Vec<Candidate>> {
        let caps = &ctx.agent.capabilities;
        let mut candidates = Vec::new();

        let mut key_terms: Vec<&str> = target.missing_capabilities.iter().map(String::as_str).collect();
        if let Some(weak) = &target.weak_capability {
            key_terms.push(weak);
        }
        let key = key_terms.join(" ");
        let filter = KnowledgeFilter::domain(STRATEGY_DOMAIN);
        for entry in ctx.recall(&key, ctx.settings.research_top_k, Some(&filter)).await? {
            let Ok(note) = serde_json::from_value::<StrategyNote>(entry.content.clone()) else {
                continue;
            };
            if !applies_to(&note.change, caps) {
                continue;
            }
            candidates.push(Candidate {
                change: note.change,
                description: note.description,
                source: CandidateSource::Knowledge {
                    entry_id: entry.id.to_string(),
                },
                expected_gain: note.expected_gain,
                confidence: note.confidence.clamp(0.0, 1.0),
            });
        }

        if let Some(name) = &target.weak_capability {
            if let Some(cfg) = caps.get(name) {
                let score = cfg.score().unwrap_or(RETUNE_BELOW);
                if score < RETUNE_BELOW {
                    candidates.push(Candidate {
                        change: DeltaOp::Modify {
                            name: name.clone(),
                            config: retuned(cfg, ctx),
                        },
                        description: format!("retune {name}"),
                        source: CandidateSource::Playbook,
                        expected_gain: (RETUNE_BELOW - score) * 0.5,
                        confidence: RETUNE_CONFIDENCE,
                    });
                }
            }
        }

        for name in &target.missing_capabilities {
            candidates.push(Candidate {
                change: DeltaOp::Add {
                    name: name.clone(),
                    config: CapabilityConfig::new(1, json!({})),
                },
                description: format!("add {name}"),
                source: CandidateSource::Playbook,
                expected_gain: GAP_GAIN,
                confidence: GAP_CONFIDENCE,
            });
        }

        if let Some(capability) = &self.research_capability {
            if ctx.has_capability(capability) {
                let output = ctx
                    .invoke(
                        capability,
                        json!({"agent_id": ctx.agent.id, "target": target}),
                    )
                    .await?;
                let found: Vec<Candidate> =
                    serde_json::from_value(output.get("candidates").cloned().unwrap_or_else(|| json!([])))
                        .map_err(|e| StageError::permanent(format!("bad research output: {e}")))?;
                candidates.extend(found.into_iter().map(|c| Candidate {
                    source: CandidateSource::Capability {
                        name: capability.clone(),
                    },
                    ..c
                }));
            }
        }

        // One candidate per capability, best first.
        rank_candidates(&mut candidates);
        let mut seen = BTreeSet::new();
        candidates.retain(|c| seen.insert(c.change.capability().to_string()));
        candidates.truncate(ctx.settings.research_top_k.max(1));
        Ok(candidates)
    }
}

fn applies_to(change: &DeltaOp, caps: &CapabilitySet) -> bool {
    match change {
        DeltaOp::Add { name, .. } => !caps.contains(name),
        DeltaOp::Modify { name, .. } | DeltaOp::Remove { name } => caps.contains(name),
    }
}

fn retuned(cfg: &CapabilityConfig, ctx: &StageContext) -> CapabilityConfig {
    let mut config = match &cfg.config {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    // The recorded score describes the old version.
    config.remove("score");
    config.insert("retuned_by".into(), json!(ctx.attempt_id));
    CapabilityConfig::new(cfg.version + 1, Value::Object(config))
}

/// Folds the top candidates into a capability delta.
#[derive(Debug, Clone, Default)]
pub struct Coder;

impl Coder {
    pub fn generate(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
        candidates: &[Candidate],
    ) -> CapabilityDelta {
        let chosen: Vec<&Candidate> = candidates
            .iter()
            .take(ctx.strategy.candidate_budget())
            .collect();

        for candidate in &chosen {
            let note = StrategyNote {
                change: candidate.change.clone(),
                description: candidate.description.clone(),
                expected_gain: candidate.expected_gain,
                confidence: candidate.confidence,
            };
            if let Ok(content) = serde_json::to_value(&note) {
                let mut terms = vec![candidate.change.capability().to_string()];
                terms.extend(target.weak_capability.iter().cloned());
                ctx.remember(
                    Stage::Generate,
                    KnowledgeKind::Knowledge {
                        domain: STRATEGY_DOMAIN.to_string(),
                    },
                    content,
                    terms,
                );
            }
        }

        CapabilityDelta {
            ops: chosen.iter().map(|c| c.change.clone()).collect(),
            rationale: chosen
                .iter()
                .map(|c| c.description.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            expected_gain: chosen.iter().map(|c| c.expected_gain).sum(),
        }
    }
}

/// Runs the shadow capability set through the held-out evaluation capability.
#[derive(Debug, Clone)]
pub struct Player {
    pub evaluator: String,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            evaluator: EVALUATE_CAPABILITY_SET.to_string(),
        }
    }
}

impl Player {
    pub async fn validate(
        &self,
        ctx: &StageContext,
        delta: &CapabilityDelta,
        shadow: &CapabilitySet,
    ) -> StageResult<ValidationReport> {
        let encode = |v: &CapabilitySet| {
            serde_json::to_value(v).map_err(|e| StageError::permanent(e.to_string()))
        };
        let params = json!({
            "current": encode(&ctx.agent.capabilities)?,
            "shadow": encode(shadow)?,
            "baseline": ctx.agent.latest_score().unwrap_or(0.0).clamp(0.0, 1.0),
            "expected_gain": delta.expected_gain,
        });
        let output = ctx.invoke(&self.evaluator, params).await?;

        let passed = output
            .get("passed")
            .and_then(Value::as_bool)
            .ok_or_else(|| StageError::permanent("evaluator output lacks `passed`"))?;
        let projected_score = output
            .get("projected_score")
            .and_then(Value::as_f64)
            .ok_or_else(|| StageError::permanent("evaluator output lacks `projected_score`"))?;
        let notes = output
            .get("notes")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("evaluated by {}", self.evaluator));

        Ok(ValidationReport {
            passed,
            projected_score,
            notes,
        })
    }
}

/// The four default roles composed into one executor.
#[derive(Debug, Clone, Default)]
pub struct DefaultStages {
    pub analyzer: Analyzer,
    pub researcher: Researcher,
    pub coder: Coder,
    pub player: Player,
}

#[async_trait]
impl StageExecutors for DefaultStages {
    async fn analyze(&self, ctx: &mut StageContext) -> StageResult<ImprovementTarget> {
        let target = self.analyzer.analyze(ctx);
        if let Ok(content) = serde_json::to_value(&target) {
            ctx.remember(
                Stage::Analyze,
                KnowledgeKind::Pattern {
                    pattern_type: "performance".to_string(),
                },
                content,
                target.weak_capability.iter().cloned().chain(["analysis".to_string()]),
            );
        }
        Ok(target)
    }

    async fn research(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
    ) -> StageResult<Vec<Candidate>> {
        self.researcher.research(ctx, target).await
    }

    async fn generate(
        &self,
        ctx: &mut StageContext,
        target: &ImprovementTarget,
        candidates: &[Candidate],
    ) -> StageResult<CapabilityDelta> {
        Ok(self.coder.generate(ctx, target, candidates))
    }

    async fn validate(
        &self,
        ctx: &mut StageContext,
        delta: &CapabilityDelta,
        shadow: &CapabilitySet,
    ) -> StageResult<ValidationReport> {
        self.player.validate(ctx, delta, shadow).await
    }
}
