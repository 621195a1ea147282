//! Capability registry: contract-described tools executed in isolation.

pub mod audit;
pub mod builtins;
pub mod contract;
pub mod descriptor;
pub mod error;
pub mod handler;
pub mod manager;

pub use audit::{AuditLog, AuditRecord};
pub use builtins::{register_defaults, EVALUATE_CAPABILITY_SET};
pub use contract::{Contract, ParamSpec, ParamType};
pub use descriptor::{CapabilityDescriptor, EffectiveLimits, InvocationBudget, ResourceLimits};
pub use error::{RegistryError, RegistryResult};
pub use handler::{CapabilityFault, CapabilityHandler, FnHandler};
pub use manager::{CapabilityRegistry, CapabilityStats};
