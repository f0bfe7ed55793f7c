//! In-memory implementations of the repository traits.
//!
//! Provides `MemoryRunRepository` and `MemoryCheckpointRepository`, which
//! satisfy the trait contracts without any external dependencies. They back
//! the test suites and the `memory` storage backend of single-process
//! deployments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryRunRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunTables {
    runs: HashMap<String, AgentRun>,
    run_order: Vec<String>,
    candidates: Vec<CandidateRecord>,
    decisions: Vec<DecisionRecord>,
}

/// In-memory run repository.
#[derive(Debug, Default)]
pub struct MemoryRunRepository {
    tables: Mutex<RunTables>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &AgentRun) -> StorageResult<()> {
        let mut tables = lock(&self.tables)?;
        if tables.runs.contains_key(run.id.as_str()) {
            return Err(StorageError::AlreadyExists {
                kind: "run",
                id: run.id.to_string(),
            });
        }
        tables.run_order.push(run.id.0.clone());
        tables.runs.insert(run.id.0.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<AgentRun> {
        let tables = lock(&self.tables)?;
        tables
            .runs
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::not_found("run", run_id.as_str()))
    }

    async fn update_run(&self, run: &AgentRun) -> StorageResult<()> {
        let mut tables = lock(&self.tables)?;
        let slot = tables
            .runs
            .get_mut(run.id.as_str())
            .ok_or_else(|| StorageError::not_found("run", run.id.as_str()))?;
        *slot = run.clone();
        Ok(())
    }

    async fn list_runs(&self) -> StorageResult<Vec<AgentRun>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .run_order
            .iter()
            .filter_map(|id| tables.runs.get(id).cloned())
            .collect())
    }

    async fn upsert_candidate(&self, candidate: &CandidateRecord) -> StorageResult<()> {
        let mut tables = lock(&self.tables)?;
        match tables.candidates.iter_mut().find(|c| c.id == candidate.id) {
            Some(existing) => *existing = candidate.clone(),
            None => tables.candidates.push(candidate.clone()),
        }
        Ok(())
    }

    async fn list_candidates(&self, run_id: &RunId) -> StorageResult<Vec<CandidateRecord>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .candidates
            .iter()
            .filter(|c| &c.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn save_decision(&self, decision: &DecisionRecord) -> StorageResult<()> {
        let mut tables = lock(&self.tables)?;
        if tables.decisions.iter().any(|d| d.id == decision.id) {
            return Err(StorageError::AlreadyExists {
                kind: "decision",
                id: decision.id.clone(),
            });
        }
        tables.decisions.push(decision.clone());
        Ok(())
    }

    async fn list_decisions(&self, run_id: &RunId) -> StorageResult<Vec<DecisionRecord>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .decisions
            .iter()
            .filter(|d| &d.run_id == run_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointRepository
// ---------------------------------------------------------------------------

/// In-memory checkpoint repository keyed by checkpoint id.
#[derive(Debug, Default)]
pub struct MemoryCheckpointRepository {
    checkpoints: Mutex<HashMap<String, CheckpointState>>,
}

impl MemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointRepository for MemoryCheckpointRepository {
    async fn insert_checkpoint(&self, checkpoint: &CheckpointState) -> StorageResult<()> {
        let mut checkpoints = lock(&self.checkpoints)?;
        if checkpoints.contains_key(checkpoint.id.as_str()) {
            return Err(StorageError::AlreadyExists {
                kind: "checkpoint",
                id: checkpoint.id.to_string(),
            });
        }
        checkpoints.insert(checkpoint.id.0.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<CheckpointState> {
        let checkpoints = lock(&self.checkpoints)?;
        checkpoints
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::not_found("checkpoint", id.as_str()))
    }

    async fn update_checkpoint(&self, checkpoint: &CheckpointState) -> StorageResult<()> {
        let mut checkpoints = lock(&self.checkpoints)?;
        let slot = checkpoints
            .get_mut(checkpoint.id.as_str())
            .ok_or_else(|| StorageError::not_found("checkpoint", checkpoint.id.as_str()))?;
        *slot = checkpoint.clone();
        Ok(())
    }

    async fn delete_checkpoint(&self, id: &CheckpointId) -> StorageResult<()> {
        let mut checkpoints = lock(&self.checkpoints)?;
        checkpoints.remove(id.as_str());
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointState>> {
        let checkpoints = lock(&self.checkpoints)?;
        let mut listed: Vec<CheckpointState> = checkpoints
            .values()
            .filter(|c| &c.run_id == run_id)
            .cloned()
            .collect();
        listed.sort_by_key(|c| c.seq);
        Ok(listed)
    }
}
