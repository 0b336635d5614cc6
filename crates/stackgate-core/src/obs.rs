//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for key lifecycle events: trigger, stage
//!   transitions, lock activity, suspension, finalization
//!
//! Events are emitted at `info!` level. For JSON output, initialize
//! telemetry with `json = true`.

use tracing::info;

use crate::domain::stage::Stage;
use stackgate_state::{RunState, StageStatus};

/// RAII guard that enters a run-scoped tracing span for the duration of a
/// run's execution.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id and stack_id.
    pub fn enter(run_id: &str, stack_id: &str) -> Self {
        let span = tracing::info_span!("stackgate.run", run_id = %run_id, stack_id = %stack_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run created from a trigger.
pub fn emit_run_triggered(run_id: &str, stack_id: &str, revision: &str) {
    info!(
        event = "run.triggered",
        run_id = %run_id,
        stack_id = %stack_id,
        revision = %revision,
    );
}

/// Emit event: one stage attempt started (correlation id is the
/// run/stage/attempt triple).
pub fn emit_stage_started(run_id: &str, stage: Stage, attempt: u32) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage, attempt = attempt);
}

/// Emit event: one stage attempt finished with its status and finding count.
pub fn emit_stage_finished(run_id: &str, stage: Stage, status: StageStatus, findings: usize) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        status = %status.as_str(),
        findings = findings,
    );
}

/// Emit event: run parked awaiting an external approval decision.
pub fn emit_run_suspended(run_id: &str, stack_id: &str) {
    info!(event = "run.suspended", run_id = %run_id, stack_id = %stack_id);
}

/// Emit event: approval decision received.
pub fn emit_approval_decision(run_id: &str, actor: &str, approved: bool) {
    info!(
        event = "approval.decided",
        run_id = %run_id,
        actor = %actor,
        approved = approved,
    );
}

/// Emit event: stack lock acquired with its fencing token.
pub fn emit_lock_acquired(run_id: &str, stack_id: &str, token: u64) {
    info!(event = "lock.acquired", run_id = %run_id, stack_id = %stack_id, token = token);
}

/// Emit event: stack lock released.
pub fn emit_lock_released(run_id: &str, stack_id: &str, token: u64) {
    info!(event = "lock.released", run_id = %run_id, stack_id = %stack_id, token = token);
}

/// Emit event: run reached a terminal state.
pub fn emit_run_finalized(run_id: &str, state: RunState, duration_ms: u64) {
    info!(
        event = "run.finalized",
        run_id = %run_id,
        state = %state,
        duration_ms = duration_ms,
    );
}

/// Emit event: reconciliation of a run left in Applying (warning level).
pub fn emit_reconcile(run_id: &str, verdict: &str) {
    tracing::warn!(event = "run.reconciled", run_id = %run_id, verdict = %verdict);
}
