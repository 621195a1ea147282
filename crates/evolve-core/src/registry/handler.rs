//! The executable side of a capability.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::descriptor::EffectiveLimits;

/// A fault reported by the capability itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityFault {
    #[error("{message}")]
    Internal { message: String, transient: bool },

    #[error("resource limit exceeded: {detail}")]
    ResourceExceeded { detail: String },
}

impl CapabilityFault {
    pub fn permanent(message: impl Into<String>) -> Self {
        CapabilityFault::Internal {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        CapabilityFault::Internal {
            message: message.into(),
            transient: true,
        }
    }
}

/// Executes validated params. Runs on its own task, so it must be `'static`.
#[async_trait]
pub trait CapabilityHandler: Send + Sync + 'static {
    async fn call(&self, params: Value, limits: EffectiveLimits) -> Result<Value, CapabilityFault>;
}

/// Adapter turning an async closure into a [`CapabilityHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Value, EffectiveLimits) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CapabilityFault>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F, Fut>
where
    F: Fn(Value, EffectiveLimits) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CapabilityFault>> + Send + 'static,
{
    async fn call(&self, params: Value, limits: EffectiveLimits) -> Result<Value, CapabilityFault> {
        (self.f)(params, limits).await
    }
}
