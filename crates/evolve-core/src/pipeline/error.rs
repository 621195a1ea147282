use crate::domain::FailureClass;
use crate::knowledge::KnowledgeError;
use crate::registry::RegistryError;

/// A stage failure, classified so the engine can decide whether to retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{class} stage failure: {message}")]
pub struct StageError {
    pub class: FailureClass,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }
}

impl From<RegistryError> for StageError {
    fn from(err: RegistryError) -> Self {
        Self {
            class: err.classification(),
            message: err.to_string(),
        }
    }
}

impl From<KnowledgeError> for StageError {
    fn from(err: KnowledgeError) -> Self {
        Self::permanent(err.to_string())
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;
