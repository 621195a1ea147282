//! Error types for the capability registry.

use crate::domain::FailureClass;

/// Errors produced by capability registration and invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("capability not found: {name}")]
    NotFound { name: String },

    #[error("capability {name} v{version} already registered with a different contract")]
    Conflict { name: String, version: u32 },

    #[error("contract violation calling {name}: {reason}")]
    ContractViolation { name: String, reason: String },

    #[error("capability {name} timed out after {limit_ms}ms")]
    Timeout { name: String, limit_ms: u64 },

    #[error("capability {name} exceeded its resource limits: {detail}")]
    ResourceExceeded { name: String, detail: String },

    #[error("capability {name} failed ({class}): {cause}")]
    Execution {
        name: String,
        class: FailureClass,
        cause: String,
    },
}

impl RegistryError {
    /// Whether a caller may retry the same invocation.
    pub fn classification(&self) -> FailureClass {
        match self {
            RegistryError::Timeout { .. } => FailureClass::Transient,
            RegistryError::Execution { class, .. } => *class,
            RegistryError::NotFound { .. }
            | RegistryError::Conflict { .. }
            | RegistryError::ContractViolation { .. }
            | RegistryError::ResourceExceeded { .. } => FailureClass::Permanent,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::Conflict { .. } => "conflict",
            RegistryError::ContractViolation { .. } => "contract_violation",
            RegistryError::Timeout { .. } => "timeout",
            RegistryError::ResourceExceeded { .. } => "resource_exceeded",
            RegistryError::Execution { .. } => "execution_error",
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        let err = RegistryError::Timeout {
            name: "slow".into(),
            limit_ms: 5000,
        };
        assert_eq!(err.classification(), FailureClass::Transient);
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn execution_carries_its_own_class() {
        let err = RegistryError::Execution {
            name: "flaky".into(),
            class: FailureClass::Transient,
            cause: "upstream 503".into(),
        };
        assert_eq!(err.classification(), FailureClass::Transient);

        let err = RegistryError::Execution {
            name: "broken".into(),
            class: FailureClass::Permanent,
            cause: "panicked".into(),
        };
        assert_eq!(err.classification(), FailureClass::Permanent);
    }

    #[test]
    fn contract_violation_is_permanent() {
        let err = RegistryError::ContractViolation {
            name: "x".into(),
            reason: "missing data".into(),
        };
        assert_eq!(err.classification(), FailureClass::Permanent);
        assert_eq!(err.code(), "contract_violation");
    }
}
