//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - A run-scoped tracing span, `run_span`
//! - Emission functions for lifecycle events: start, phase stages,
//!   decisions, checkpoints, forks and finish
//!
//! Events are emitted at `info!` level (fallbacks and failures at `warn!`).
//! Filtering follows `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{info, warn};

use crate::domain::{CheckpointStatus, DecisionMethod, Phase};

/// Span that tags everything a run does with its id.
///
/// ```ignore
/// runner.execute(&run_id).instrument(obs::run_span(run_id.as_str())).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("conclave.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, is_fork: bool) {
    info!(event = "run.started", run_id = %run_id, is_fork);
}

/// Emit event: a phase moved to a new substate (dispatching, evaluating, ...).
pub fn emit_phase_stage(run_id: &str, phase: Phase, attempt: u32, stage: &str) {
    info!(event = "phase.stage", run_id = %run_id, phase = %phase, attempt, stage = %stage);
}

pub fn emit_phase_decided(
    run_id: &str,
    phase: Phase,
    candidate_id: &str,
    method: DecisionMethod,
    score: f64,
) {
    info!(
        event = "phase.decided",
        run_id = %run_id,
        phase = %phase,
        candidate_id = %candidate_id,
        method = ?method,
        score,
    );
}

pub fn emit_checkpoint_saved(run_id: &str, seq: u64, phase: Phase, status: CheckpointStatus) {
    info!(event = "checkpoint.saved", run_id = %run_id, seq, phase = %phase, status = %status);
}

pub fn emit_run_forked(parent_run_id: &str, run_id: &str, checkpoint_id: &str) {
    info!(
        event = "run.forked",
        parent_run_id = %parent_run_id,
        run_id = %run_id,
        checkpoint_id = %checkpoint_id,
    );
}

/// Emit event (warn): the judge was bypassed in favor of the tie-break.
pub fn emit_judge_fallback(run_id: &str, phase: Phase, reason: &str) {
    warn!(event = "judge.fallback", run_id = %run_id, phase = %phase, reason = %reason);
}

pub fn emit_verification_failed(run_id: &str, attempt: u32, retrying: bool) {
    warn!(event = "verification.failed", run_id = %run_id, attempt, retrying);
}

/// Emit event: run reached a terminal state.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool, reason: Option<&str>) {
    if success {
        info!(event = "run.finished", run_id = %run_id, duration_ms, success);
    } else {
        warn!(
            event = "run.finished",
            run_id = %run_id,
            duration_ms,
            success,
            reason = reason.unwrap_or("unknown"),
        );
    }
}
