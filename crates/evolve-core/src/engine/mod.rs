//! Evolution engine: leases, eligibility, persistence, the attempt runner
//! and the scheduler that feeds it.

pub mod lease;
pub mod repository;
pub mod runner;
pub mod scheduler;
pub mod trigger;

pub use lease::{LeaseGuard, LeaseTable};
pub use repository::{AgentRepository, AttemptHistory};
pub use runner::{backoff_delay, AttemptRequest, EvolutionEngine};
pub use scheduler::{Scheduler, TriggerOutcome};
pub use trigger::{Ineligible, TriggerPolicy};
