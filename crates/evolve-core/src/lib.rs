//! Evolve Core Library
//!
//! Autonomous agent evolution: a per-agent knowledge store, a capability
//! registry with contract-checked isolated invocation, and a staged
//! Analyze / Research / Generate / Validate pipeline that commits a new
//! capability set only when it does not regress.
//!
//! Most callers only need [`EvolutionService`].

pub mod config;
pub mod domain;
pub mod engine;
pub mod knowledge;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod telemetry;

pub use config::{EvolutionConfig, RankingMode};

pub use domain::{
    AgentId, AgentRecord, AgentStatus, AgentSummary, AttemptId, AttemptOutcome, AttemptReason,
    CapabilityConfig, CapabilityDelta, CapabilitySet, DeltaOp, EvolutionAttempt, EvolutionError,
    EvolutionStrategy, FailureClass, Result, Stage, TriggerReason,
};

pub use engine::{Ineligible, LeaseTable, TriggerOutcome};

pub use knowledge::{
    EntryId, KnowledgeEntry, KnowledgeError, KnowledgeFilter, KnowledgeKind, KnowledgeStore,
    MemoryStats, PutOutcome,
};

pub use pipeline::{DefaultStages, StageContext, StageError, StageExecutors};

pub use registry::{
    CapabilityDescriptor, CapabilityFault, CapabilityHandler, CapabilityRegistry, CapabilityStats,
    Contract, FnHandler, InvocationBudget, ParamSpec, ParamType, RegistryError,
};

pub use service::{EvolutionService, EvolutionServiceBuilder};
