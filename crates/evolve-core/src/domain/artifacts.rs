//! Artifacts passed between pipeline stages and kept on the attempt record.

use serde::{Deserialize, Serialize};

use super::delta::{CapabilityDelta, DeltaOp};

/// Analyze output: what to improve and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementTarget {
    /// Capability with the lowest recorded score, if any scored capability exists.
    pub weak_capability: Option<String>,
    pub deficiency: String,
    /// Mean of the recent score window.
    pub overall_score: f64,
    /// Last minus first score of the recent window.
    pub trend: f64,
    pub missing_capabilities: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateSource {
    Knowledge { entry_id: String },
    Playbook,
    Capability { name: String },
}

/// Research output: one proposed change with its expected payoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub change: DeltaOp,
    pub description: String,
    pub source: CandidateSource,
    pub expected_gain: f64,
    /// 0.0..=1.0
    pub confidence: f64,
}

impl Candidate {
    pub fn rank_score(&self) -> f64 {
        self.expected_gain * self.confidence
    }
}

/// Sort candidates best-first: rank score, then description for determinism.
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.rank_score()
            .total_cmp(&a.rank_score())
            .then_with(|| a.description.cmp(&b.description))
    });
}

/// Validate output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub projected_score: f64,
    #[serde(default)]
    pub notes: String,
}

/// Everything the stages of one attempt produced, in stage order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageArtifacts {
    pub target: Option<ImprovementTarget>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub delta: Option<CapabilityDelta>,
    pub validation: Option<ValidationReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(desc: &str, gain: f64, confidence: f64) -> Candidate {
        Candidate {
            change: DeltaOp::Remove { name: desc.into() },
            description: desc.into(),
            source: CandidateSource::Playbook,
            expected_gain: gain,
            confidence,
        }
    }

    #[test]
    fn ranking_is_gain_times_confidence() {
        let mut list = vec![
            candidate("low", 0.2, 0.5),
            candidate("high", 0.3, 0.9),
            candidate("mid", 0.5, 0.4),
        ];
        rank_candidates(&mut list);
        let order: Vec<_> = list.iter().map(|c| c.description.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn ranking_ties_break_by_description() {
        let mut list = vec![candidate("b", 0.5, 0.5), candidate("a", 0.5, 0.5)];
        rank_candidates(&mut list);
        assert_eq!(list[0].description, "a");
    }
}
