//! Checkpoint management: ordered per-run snapshots, retention, restore and fork.
//!
//! Writes for one run go through that run's async lock, so two writers can
//! never interleave a retention pass with an insert. Different runs do not
//! contend. Terminal checkpoints (`completed`, `failed`) are immutable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, instrument};

use conclave_state::{CheckpointRepository, RunRepository};

use crate::domain::{
    AgentRun, CheckpointId, CheckpointState, CheckpointStatus, ConclaveError, Phase, Result, RunId,
    RunStatus, TokenMetrics,
};
use crate::metrics::METRICS;
use crate::obs;

pub const DEFAULT_MAX_CHECKPOINTS: usize = 20;

/// Optional starting values for a new checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSeed {
    pub parent_checkpoint_id: Option<CheckpointId>,
    pub token_metrics: TokenMetrics,
    pub context: serde_json::Value,
}

/// Per-run write lock; guards the next sequence number.
#[derive(Debug, Default)]
struct RunSlot {
    next_seq: Option<u64>,
}

pub struct CheckpointManager {
    checkpoints: Arc<dyn CheckpointRepository>,
    runs: Arc<dyn RunRepository>,
    max_checkpoints: usize,
    slots: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<RunSlot>>>>,
}

impl CheckpointManager {
    pub fn new(
        checkpoints: Arc<dyn CheckpointRepository>,
        runs: Arc<dyn RunRepository>,
        max_checkpoints: usize,
    ) -> Self {
        Self {
            checkpoints,
            runs,
            max_checkpoints: max_checkpoints.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_checkpoints(&self) -> usize {
        self.max_checkpoints
    }

    fn slot(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<RunSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(run_id.clone()).or_default())
    }

    /// Drop the write lock kept for `run_id` once nothing else holds it.
    ///
    /// Called when a run stops executing. A later write re-derives the next
    /// sequence number from storage.
    pub fn release(&self, run_id: &RunId) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(run_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(run_id);
        }
    }

    #[cfg(test)]
    fn tracked_runs(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn create(
        &self,
        run_id: &RunId,
        phase: Phase,
        status: CheckpointStatus,
    ) -> Result<CheckpointState> {
        self.create_with(run_id, phase, status, CheckpointSeed::default())
            .await
    }

    /// Append a checkpoint to `run_id`, evicting the oldest non-running
    /// checkpoints first if the run is at `max_checkpoints`.
    #[instrument(skip(self, seed), fields(run_id = %run_id, phase = %phase))]
    pub async fn create_with(
        &self,
        run_id: &RunId,
        phase: Phase,
        status: CheckpointStatus,
        seed: CheckpointSeed,
    ) -> Result<CheckpointState> {
        let slot = self.slot(run_id);
        let mut slot = slot.lock().await;

        let existing = self.checkpoints.list_checkpoints(run_id).await?;
        let next_seq = slot
            .next_seq
            .unwrap_or_else(|| existing.last().map_or(1, |c| c.seq + 1));

        let overflow = (existing.len() + 1).saturating_sub(self.max_checkpoints);
        if overflow > 0 {
            let victims: Vec<&CheckpointState> = existing
                .iter()
                .filter(|c| c.status != CheckpointStatus::Running)
                .take(overflow)
                .collect();
            if victims.len() < overflow {
                return Err(ConclaveError::InvalidState(format!(
                    "run {run_id} has {} running checkpoint(s) and max_checkpoints is {}; nothing can be evicted",
                    existing.len() - victims.len(),
                    self.max_checkpoints
                )));
            }
            for victim in victims {
                debug!(checkpoint = %victim.id, seq = victim.seq, "evicting checkpoint");
                self.checkpoints.delete_checkpoint(&victim.id).await?;
            }
        }

        let now = Utc::now();
        let checkpoint = CheckpointState {
            id: CheckpointId::new(),
            run_id: run_id.clone(),
            seq: next_seq,
            phase,
            status,
            phase_start_time: (status == CheckpointStatus::Running).then_some(now),
            phase_end_time: status.is_terminal().then_some(now),
            token_metrics: seed.token_metrics,
            parent_checkpoint_id: seed.parent_checkpoint_id,
            failure_reason: None,
            context: seed.context,
            created_at: now,
        };
        self.checkpoints.insert_checkpoint(&checkpoint).await?;
        slot.next_seq = Some(next_seq + 1);

        obs::emit_checkpoint_saved(run_id.as_str(), checkpoint.seq, phase, status);
        Ok(checkpoint)
    }

    /// Load, check mutability, apply `change`, store. Holds the run lock throughout.
    async fn mutate(
        &self,
        id: &CheckpointId,
        change: impl FnOnce(&mut CheckpointState),
    ) -> Result<CheckpointState> {
        let run_id = self.checkpoints.get_checkpoint(id).await?.run_id;
        let slot = self.slot(&run_id);
        let _guard = slot.lock().await;

        let mut checkpoint = self.checkpoints.get_checkpoint(id).await?;
        if checkpoint.status.is_terminal() {
            return Err(ConclaveError::InvalidState(format!(
                "checkpoint {id} is {} and cannot be modified",
                checkpoint.status
            )));
        }
        change(&mut checkpoint);
        self.checkpoints.update_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Set `status` and add `token_delta` to the checkpoint's metrics.
    pub async fn update(
        &self,
        id: &CheckpointId,
        status: CheckpointStatus,
        token_delta: TokenMetrics,
    ) -> Result<CheckpointState> {
        self.mutate(id, |cp| {
            let now = Utc::now();
            if status == CheckpointStatus::Running && cp.phase_start_time.is_none() {
                cp.phase_start_time = Some(now);
            }
            if status.is_terminal() {
                cp.phase_end_time = Some(now);
            }
            cp.status = status;
            cp.token_metrics.accumulate(token_delta);
        })
        .await
    }

    pub async fn set_context(
        &self,
        id: &CheckpointId,
        context: serde_json::Value,
    ) -> Result<CheckpointState> {
        self.mutate(id, |cp| cp.context = context).await
    }

    pub async fn complete(&self, id: &CheckpointId) -> Result<CheckpointState> {
        self.update(id, CheckpointStatus::Completed, TokenMetrics::default())
            .await
    }

    pub async fn fail(&self, id: &CheckpointId, reason: impl Into<String>) -> Result<CheckpointState> {
        let reason = reason.into();
        self.mutate(id, |cp| {
            cp.status = CheckpointStatus::Failed;
            cp.phase_end_time = Some(Utc::now());
            cp.failure_reason = Some(reason);
        })
        .await
    }

    pub async fn get(&self, id: &CheckpointId) -> Result<CheckpointState> {
        Ok(self.checkpoints.get_checkpoint(id).await?)
    }

    /// Checkpoints for `run_id`, ordered by `seq`.
    pub async fn list(&self, run_id: &RunId) -> Result<Vec<CheckpointState>> {
        Ok(self.checkpoints.list_checkpoints(run_id).await?)
    }

    pub async fn latest(&self, run_id: &RunId) -> Result<Option<CheckpointState>> {
        Ok(self.list(run_id).await?.pop())
    }

    /// The stored state of checkpoint `id`, as a resume point.
    pub async fn restore(&self, id: &CheckpointId) -> Result<CheckpointState> {
        let checkpoint = self.get(id).await?;
        info!(checkpoint = %id, run_id = %checkpoint.run_id, phase = %checkpoint.phase, "checkpoint restored");
        Ok(checkpoint)
    }

    /// Branch a new run off checkpoint `id`.
    ///
    /// The new run copies the source run's input and points back at the
    /// source run and checkpoint. Its first checkpoint is `pending` in the
    /// same phase, carrying the source's metrics and context. The source run
    /// and its checkpoints are left untouched.
    #[instrument(skip(self, label, reason), fields(checkpoint = %id))]
    pub async fn fork(
        &self,
        id: &CheckpointId,
        label: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<AgentRun> {
        let source = self.get(id).await?;
        let parent = self.runs.get_run(&source.run_id).await?;

        let mut run = AgentRun::new(parent.input.clone());
        run.parent_run_id = Some(parent.id.clone());
        run.parent_checkpoint_id = Some(source.id.clone());
        run.fork_label = Some(label.into());
        run.fork_reason = Some(reason.into());
        run.status = RunStatus::Planned;
        run.current_phase = Some(source.phase);
        run.token_metrics = source.token_metrics;
        self.runs.create_run(&run).await?;

        self.create_with(
            &run.id,
            source.phase,
            CheckpointStatus::Pending,
            CheckpointSeed {
                parent_checkpoint_id: Some(source.id.clone()),
                token_metrics: source.token_metrics,
                context: source.context.clone(),
            },
        )
        .await?;

        METRICS.inc_forks();
        obs::emit_run_forked(parent.id.as_str(), run.id.as_str(), source.id.as_str());
        Ok(run)
    }
}
