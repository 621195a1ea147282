//! Proposed change to an agent's capability set.

use serde::{Deserialize, Serialize};

use super::agent::CapabilityConfig;

/// A single capability change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    Add { name: String, config: CapabilityConfig },
    Modify { name: String, config: CapabilityConfig },
    Remove { name: String },
}

impl DeltaOp {
    pub fn capability(&self) -> &str {
        match self {
            DeltaOp::Add { name, .. } | DeltaOp::Modify { name, .. } | DeltaOp::Remove { name } => {
                name
            }
        }
    }
}

/// Ordered list of capability changes produced by the Generate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDelta {
    pub ops: Vec<DeltaOp>,
    #[serde(default)]
    pub rationale: String,
    /// Sum of the expected gains of the candidates folded into this delta.
    #[serde(default)]
    pub expected_gain: f64,
}

impl CapabilityDelta {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Names of every capability the delta touches, in op order.
    pub fn touched(&self) -> Vec<&str> {
        self.ops.iter().map(DeltaOp::capability).collect()
    }
}
