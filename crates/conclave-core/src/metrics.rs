//! Process-wide atomic counters.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a run finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub agent_failures: u64,
    pub judge_fallbacks: u64,
    pub forks_created: u64,
    pub verification_retries: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
}

pub struct Metrics {
    dispatches: AtomicU64,
    agent_failures: AtomicU64,
    judge_fallbacks: AtomicU64,
    forks_created: AtomicU64,
    verification_retries: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, metric: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            agent_failures: AtomicU64::new(0),
            judge_fallbacks: AtomicU64::new(0),
            forks_created: AtomicU64::new(0),
            verification_retries: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
        }
    }

    /// One agent call issued by the dispatcher.
    pub fn inc_dispatches(&self) {
        bump(&self.dispatches, "dispatches");
    }

    pub fn inc_agent_failures(&self) {
        bump(&self.agent_failures, "agent_failures");
    }

    pub fn inc_judge_fallbacks(&self) {
        bump(&self.judge_fallbacks, "judge_fallbacks");
    }

    pub fn inc_forks(&self) {
        bump(&self.forks_created, "forks_created");
    }

    pub fn inc_verification_retries(&self) {
        bump(&self.verification_retries, "verification_retries");
    }

    pub fn inc_runs_finished(&self, success: bool) {
        if success {
            bump(&self.runs_completed, "runs_completed");
        } else {
            bump(&self.runs_failed, "runs_failed");
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            agent_failures: self.agent_failures.load(Ordering::Relaxed),
            judge_fallbacks: self.judge_fallbacks.load(Ordering::Relaxed),
            forks_created: self.forks_created.load(Ordering::Relaxed),
            verification_retries: self.verification_retries.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            dispatches = s.dispatches,
            agent_failures = s.agent_failures,
            judge_fallbacks = s.judge_fallbacks,
            forks_created = s.forks_created,
            verification_retries = s.verification_retries,
            runs_completed = s.runs_completed,
            runs_failed = s.runs_failed,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.dispatches,
            &self.agent_failures,
            &self.judge_fallbacks,
            &self.forks_created,
            &self.verification_retries,
            &self.runs_completed,
            &self.runs_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
