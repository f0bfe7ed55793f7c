//! Observability tests for the run lifecycle.
//!
//! These check that the structured tracing hooks can be driven for every
//! lifecycle event, and that the process counters move.

use conclave_core::metrics::METRICS;
use conclave_core::obs::{
    emit_checkpoint_saved, emit_judge_fallback, emit_phase_decided, emit_phase_stage,
    emit_run_finished, emit_run_forked, emit_run_started, emit_verification_failed, run_span,
};
use conclave_core::{CheckpointStatus, DecisionMethod, Phase};
use tracing::Instrument;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_emit_run_started_and_finished() {
    emit_run_started("run-123", false);
    emit_run_finished("run-123", 5000, true, None);
    emit_run_finished("run-123", 10, false, Some("zero candidates"));
}

#[traced_test]
#[test]
fn test_emit_phase_events() {
    for stage in ["dispatching", "evaluating", "judging", "decided"] {
        emit_phase_stage("run-456", Phase::Coding, 1, stage);
    }
    emit_phase_decided("run-456", Phase::Coding, "cand-1", DecisionMethod::Judge, 0.9);
    emit_judge_fallback("run-456", Phase::Coding, "no JSON object in judge output");
    emit_verification_failed("run-456", 2, false);
}

#[traced_test]
#[test]
fn test_emit_checkpoint_and_fork() {
    emit_checkpoint_saved("run-789", 3, Phase::Verification, CheckpointStatus::Completed);
    emit_run_forked("run-789", "run-790", "cp-3");
}

#[traced_test]
#[tokio::test]
async fn test_run_span_wraps_async_work() {
    async {
        emit_run_started("run-span", true);
    }
    .instrument(run_span("run-span"))
    .await;
}

#[test]
fn test_metrics_snapshot_moves_forward() {
    let before = METRICS.snapshot();
    METRICS.inc_forks();
    METRICS.inc_runs_finished(true);
    METRICS.inc_runs_finished(false);
    let after = METRICS.snapshot();
    assert!(after.forks_created > before.forks_created);
    assert!(after.runs_completed > before.runs_completed);
    assert!(after.runs_failed > before.runs_failed);
}
