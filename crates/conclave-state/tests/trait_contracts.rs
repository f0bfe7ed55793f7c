//! Trait contract tests for RunRepository and CheckpointRepository.
//!
//! Each contract runs against the in-memory fakes and the SurrealDB store.
//! Any conforming implementation must pass these.

use chrono::Utc;
use conclave_state::fakes::{MemoryCheckpointRepository, MemoryRunRepository};
use conclave_state::storage_traits::*;
use conclave_state::{StorageError, SurrealStore};

fn sample_run() -> AgentRun {
    AgentRun::new(RunInput::new("implement the tokenizer"))
}

fn sample_candidate(run_id: &RunId, index: usize) -> CandidateRecord {
    let output = format!("candidate output {index}");
    let now = Utc::now();
    CandidateRecord {
        id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.clone(),
        phase: Phase::Coding,
        attempt: 1,
        dispatch_index: index,
        agent_name: format!("agent-{index}"),
        provider: "local".to_string(),
        model_name: "stub".to_string(),
        output_digest: ContentDigest::from_bytes(output.as_bytes()),
        output,
        usage: TokenMetrics::new(10, 20, 5),
        started_at: now,
        completed_at: now,
        duration_ms: 12,
        evaluations: Vec::new(),
    }
}

fn sample_decision(run_id: &RunId, candidate_id: &str) -> DecisionRecord {
    DecisionRecord {
        id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.clone(),
        phase: Phase::Coding,
        attempt: 1,
        candidate_id: candidate_id.to_string(),
        score: 0.75,
        rationale: "clearest implementation".to_string(),
        model_name: "judge-model".to_string(),
        method: DecisionMethod::Judge,
        created_at: Utc::now(),
    }
}

fn sample_checkpoint(run_id: &RunId, seq: u64) -> CheckpointState {
    CheckpointState {
        id: CheckpointId::new(),
        run_id: run_id.clone(),
        seq,
        phase: Phase::Planning,
        status: CheckpointStatus::Pending,
        phase_start_time: None,
        phase_end_time: None,
        token_metrics: TokenMetrics::default(),
        parent_checkpoint_id: None,
        failure_reason: None,
        context: serde_json::json!({}),
        created_at: Utc::now(),
    }
}

// ===========================================================================
// RunRepository contracts
// ===========================================================================

async fn contract_run_round_trip(repo: &dyn RunRepository) {
    let run = sample_run();
    repo.create_run(&run).await.unwrap();
    assert_eq!(repo.get_run(&run.id).await.unwrap(), run);

    let err = repo.create_run(&run).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }));
}

async fn contract_run_update_and_missing(repo: &dyn RunRepository) {
    let mut run = sample_run();
    repo.create_run(&run).await.unwrap();

    run.status = RunStatus::Failed;
    run.failure_reason = Some("timeout".to_string());
    repo.update_run(&run).await.unwrap();
    let stored = repo.get_run(&run.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("timeout"));

    let ghost = sample_run();
    assert!(repo.update_run(&ghost).await.unwrap_err().is_not_found());
    assert!(repo.get_run(&ghost.id).await.unwrap_err().is_not_found());
}

async fn contract_candidates_and_decisions(repo: &dyn RunRepository) {
    let run = sample_run();
    repo.create_run(&run).await.unwrap();
    let other = sample_run();
    repo.create_run(&other).await.unwrap();

    let first = sample_candidate(&run.id, 0);
    let mut second = sample_candidate(&run.id, 1);
    repo.upsert_candidate(&first).await.unwrap();
    repo.upsert_candidate(&second).await.unwrap();
    repo.upsert_candidate(&sample_candidate(&other.id, 0))
        .await
        .unwrap();

    second.evaluations.push(EvaluationResult::from_criteria(
        "markers",
        EvaluationCategory::Deterministic,
        vec![CriterionResult::pass("non_empty", "ok")],
    ));
    repo.upsert_candidate(&second).await.unwrap();

    let listed = repo.list_candidates(&run.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[1].evaluations.len(), 1);

    let decision = sample_decision(&run.id, &second.id);
    repo.save_decision(&decision).await.unwrap();
    let err = repo.save_decision(&decision).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }));

    let decisions = repo.list_decisions(&run.id).await.unwrap();
    assert_eq!(decisions, vec![decision]);
    assert!(repo.list_decisions(&other.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_run_repository_contracts() {
    let repo = MemoryRunRepository::new();
    contract_run_round_trip(&repo).await;
    contract_run_update_and_missing(&repo).await;
    contract_candidates_and_decisions(&repo).await;
    assert_eq!(repo.list_runs().await.unwrap().len(), 4);
}

#[tokio::test]
async fn surreal_run_repository_contracts() {
    let repo = SurrealStore::in_memory().await.unwrap();
    contract_run_round_trip(&repo).await;
    contract_run_update_and_missing(&repo).await;
    contract_candidates_and_decisions(&repo).await;
    assert_eq!(repo.list_runs().await.unwrap().len(), 4);
}

// ===========================================================================
// CheckpointRepository contracts
// ===========================================================================

async fn contract_checkpoint_ordering(repo: &dyn CheckpointRepository) {
    let run_id = RunId::new();
    let third = sample_checkpoint(&run_id, 3);
    let first = sample_checkpoint(&run_id, 1);
    let second = sample_checkpoint(&run_id, 2);
    for cp in [&third, &first, &second] {
        repo.insert_checkpoint(cp).await.unwrap();
    }
    repo.insert_checkpoint(&sample_checkpoint(&RunId::new(), 1))
        .await
        .unwrap();

    let seqs: Vec<u64> = repo
        .list_checkpoints(&run_id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let err = repo.insert_checkpoint(&first).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }));
}

async fn contract_checkpoint_update_delete(repo: &dyn CheckpointRepository) {
    let run_id = RunId::new();
    let mut cp = sample_checkpoint(&run_id, 1);
    repo.insert_checkpoint(&cp).await.unwrap();

    cp.status = CheckpointStatus::Completed;
    cp.token_metrics = TokenMetrics::new(5, 5, 1);
    repo.update_checkpoint(&cp).await.unwrap();
    assert_eq!(repo.get_checkpoint(&cp.id).await.unwrap(), cp);

    repo.delete_checkpoint(&cp.id).await.unwrap();
    assert!(repo.get_checkpoint(&cp.id).await.unwrap_err().is_not_found());
    assert!(repo.update_checkpoint(&cp).await.unwrap_err().is_not_found());
    // Deleting twice is a no-op.
    repo.delete_checkpoint(&cp.id).await.unwrap();
}

#[tokio::test]
async fn memory_checkpoint_repository_contracts() {
    let repo = MemoryCheckpointRepository::new();
    contract_checkpoint_ordering(&repo).await;
    contract_checkpoint_update_delete(&repo).await;
}

#[tokio::test]
async fn surreal_checkpoint_repository_contracts() {
    let repo = SurrealStore::in_memory().await.unwrap();
    contract_checkpoint_ordering(&repo).await;
    contract_checkpoint_update_delete(&repo).await;
}
