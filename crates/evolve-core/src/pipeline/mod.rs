//! Staged evolution pipeline: Analyze, Research, Generate, Validate.

pub mod error;
pub mod roles;
pub mod stage;
pub mod state;

pub use error::{StageError, StageResult};
pub use roles::{Analyzer, Coder, DefaultStages, Player, Researcher, StrategyNote, STRATEGY_DOMAIN};
pub use stage::{PipelineSettings, StageContext, StageExecutors};
pub use state::{PipelineState, StageOutput, Step};
