//! Structured observability hooks for evolution attempt lifecycle events.
//!
//! This module provides:
//! - Attempt-scoped tracing spans via the `AttemptSpan` RAII guard
//! - Emission functions for trigger decisions, stage progress, capability
//!   invocations and terminal outcomes
//!
//! Field names are stable; log pipelines key on `event`.

use tracing::{info, warn};

/// RAII guard that enters an attempt-scoped span for its lifetime.
///
/// Only hold this across synchronous sections; async code uses
/// `tracing::Instrument` with [`attempt_span`] instead.
pub struct AttemptSpan {
    _span: tracing::span::EnteredSpan,
}

impl AttemptSpan {
    /// Create and enter a span tagged with agent and attempt ids.
    pub fn enter(agent_id: &str, attempt_id: &str) -> Self {
        Self {
            _span: attempt_span(agent_id, attempt_id).entered(),
        }
    }
}

/// The `evolution.attempt` span, un-entered.
pub fn attempt_span(agent_id: &str, attempt_id: &str) -> tracing::Span {
    tracing::info_span!("evolution.attempt", agent_id = %agent_id, attempt_id = %attempt_id)
}

/// Emit event: attempt started.
pub fn emit_attempt_started(agent_id: &str, attempt_id: &str, trigger: &str, strategy: &str) {
    info!(
        event = "attempt.started",
        agent_id = %agent_id,
        attempt_id = %attempt_id,
        trigger = %trigger,
        strategy = %strategy,
    );
}

/// Emit event: a pipeline stage began.
pub fn emit_stage_entered(attempt_id: &str, stage: &str) {
    info!(event = "attempt.stage_entered", attempt_id = %attempt_id, stage = %stage);
}

/// Emit event: a transient stage failure is being retried.
pub fn emit_stage_retry(attempt_id: &str, stage: &str, retry: u32, backoff_ms: u64, cause: &str) {
    warn!(
        event = "attempt.stage_retry",
        attempt_id = %attempt_id,
        stage = %stage,
        retry = retry,
        backoff_ms = backoff_ms,
        cause = %cause,
    );
}

/// Emit event: attempt reached a terminal outcome.
pub fn emit_attempt_finished(
    agent_id: &str,
    attempt_id: &str,
    outcome: &str,
    reason: Option<&str>,
    duration_ms: u64,
) {
    info!(
        event = "attempt.finished",
        agent_id = %agent_id,
        attempt_id = %attempt_id,
        outcome = %outcome,
        reason = reason.unwrap_or(""),
        duration_ms = duration_ms,
    );
}

/// Emit event: a trigger request was turned away or absorbed.
pub fn emit_trigger_rejected(agent_id: &str, reason: &str) {
    info!(event = "trigger.rejected", agent_id = %agent_id, reason = %reason);
}

/// Emit event: a capability invocation completed (any outcome).
pub fn emit_capability_invoked(name: &str, params_digest: &str, duration_ms: u64, outcome: &str) {
    info!(
        event = "capability.invoked",
        capability = %name,
        params_digest = %params_digest,
        duration_ms = duration_ms,
        outcome = %outcome,
    );
}

/// Emit event: writing the attempt record failed after the outcome was decided.
pub fn emit_history_write_error(attempt_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "attempt.history_error", attempt_id = %attempt_id, error = %error);
}
