//! Checkpoint ordering, eviction, forking and token accounting.

use std::sync::Arc;

use conclave_core::{CheckpointManager, CheckpointStatus, Phase, RunStatus, TokenMetrics};
use conclave_state::fakes::{MemoryCheckpointRepository, MemoryRunRepository};
use conclave_state::{AgentRun, RunInput, RunRepository};

fn manager(max: usize) -> (CheckpointManager, Arc<MemoryRunRepository>) {
    let runs = Arc::new(MemoryRunRepository::new());
    let manager = CheckpointManager::new(
        Arc::new(MemoryCheckpointRepository::new()),
        runs.clone(),
        max,
    );
    (manager, runs)
}

async fn stored_run(runs: &MemoryRunRepository, message: &str) -> AgentRun {
    let run = AgentRun::new(RunInput::new(message));
    runs.create_run(&run).await.unwrap();
    run
}

#[tokio::test]
async fn test_eviction_keeps_newest_five() {
    let (manager, runs) = manager(5);
    let run = stored_run(&runs, "evict").await;

    for i in 0..8 {
        let cp = manager
            .create(&run.id, Phase::ALL[i % 3], CheckpointStatus::Running)
            .await
            .unwrap();
        manager.complete(&cp.id).await.unwrap();
    }

    let seqs: Vec<u64> = manager
        .list(&run.id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.seq)
        .collect();
    assert_eq!(seqs, vec![4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn test_eviction_skips_running_checkpoints() {
    let (manager, runs) = manager(3);
    let run = stored_run(&runs, "busy").await;

    let oldest = manager
        .create(&run.id, Phase::Planning, CheckpointStatus::Running)
        .await
        .unwrap();
    for _ in 0..2 {
        manager
            .create(&run.id, Phase::Coding, CheckpointStatus::Completed)
            .await
            .unwrap();
    }
    manager
        .create(&run.id, Phase::Verification, CheckpointStatus::Pending)
        .await
        .unwrap();

    let remaining = manager.list(&run.id).await.unwrap();
    let seqs: Vec<u64> = remaining.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, vec![1, 3, 4]);
    assert_eq!(remaining[0].id, oldest.id);
}

#[tokio::test]
async fn test_running_checkpoint_records_start_time_and_terminal_records_end() {
    let (manager, runs) = manager(5);
    let run = stored_run(&runs, "times").await;

    let cp = manager
        .create(&run.id, Phase::Coding, CheckpointStatus::Pending)
        .await
        .unwrap();
    assert!(cp.phase_start_time.is_none());

    let running = manager
        .update(&cp.id, CheckpointStatus::Running, TokenMetrics::new(1, 1, 0))
        .await
        .unwrap();
    assert!(running.phase_start_time.is_some());
    assert!(running.phase_end_time.is_none());

    let failed = manager.fail(&cp.id, "agent pool empty").await.unwrap();
    assert_eq!(failed.status, CheckpointStatus::Failed);
    assert!(failed.phase_end_time.is_some());
    assert_eq!(failed.failure_reason.as_deref(), Some("agent pool empty"));
    assert_eq!(failed.token_metrics.total_tokens, 2);
}

#[tokio::test]
async fn test_fork_links_parent_and_isolates_state() {
    let (manager, runs) = manager(10);
    let parent = stored_run(&runs, "original task").await;

    let planning = manager
        .create(&parent.id, Phase::Planning, CheckpointStatus::Running)
        .await
        .unwrap();
    manager
        .set_context(&planning.id, serde_json::json!({"selections": [], "verification_failures": 0}))
        .await
        .unwrap();
    manager
        .update(&planning.id, CheckpointStatus::Completed, TokenMetrics::new(40, 10, 7))
        .await
        .unwrap();

    let fork = manager
        .fork(&planning.id, "alt-plan", "explore")
        .await
        .unwrap();
    assert_eq!(fork.status, RunStatus::Planned);
    assert_eq!(fork.parent_run_id.as_ref(), Some(&parent.id));
    assert_eq!(fork.parent_checkpoint_id.as_ref(), Some(&planning.id));
    assert_eq!(fork.fork_reason.as_deref(), Some("explore"));
    assert_eq!(fork.input.message, "original task");
    assert_eq!(fork.token_metrics.total_tokens, 50);
    assert!(fork.is_fork());

    let fork_checkpoints = manager.list(&fork.id).await.unwrap();
    assert_eq!(fork_checkpoints.len(), 1);
    let first = &fork_checkpoints[0];
    assert_eq!(first.seq, 1);
    assert_eq!(first.status, CheckpointStatus::Pending);
    assert_eq!(first.phase, Phase::Planning);
    assert_eq!(first.parent_checkpoint_id.as_ref(), Some(&planning.id));
    assert_eq!(first.context["verification_failures"], 0);

    // Writing to the fork leaves the parent alone.
    manager
        .create(&fork.id, Phase::Coding, CheckpointStatus::Running)
        .await
        .unwrap();
    assert_eq!(manager.list(&parent.id).await.unwrap().len(), 1);
    assert_eq!(manager.list(&fork.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_fork_of_fork_chains_parents() {
    let (manager, runs) = manager(10);
    let root = stored_run(&runs, "root").await;
    let cp = manager
        .create(&root.id, Phase::Planning, CheckpointStatus::Completed)
        .await
        .unwrap();

    let child = manager.fork(&cp.id, "child", "first").await.unwrap();
    let child_cp = manager.latest(&child.id).await.unwrap().unwrap();
    let grandchild = manager.fork(&child_cp.id, "grandchild", "second").await.unwrap();

    assert_eq!(grandchild.parent_run_id.as_ref(), Some(&child.id));
    assert_eq!(child.parent_run_id.as_ref(), Some(&root.id));
    let stored = runs.get_run(&grandchild.id).await.unwrap();
    assert_eq!(stored.fork_label.as_deref(), Some("grandchild"));
}

#[tokio::test]
async fn test_restore_returns_stored_state() {
    let (manager, runs) = manager(5);
    let run = stored_run(&runs, "restore").await;
    let cp = manager
        .create(&run.id, Phase::Verification, CheckpointStatus::Completed)
        .await
        .unwrap();

    let restored = manager.restore(&cp.id).await.unwrap();
    assert_eq!(restored, cp);

    let err = manager.restore(&conclave_core::CheckpointId::new()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_token_metrics_merge_is_associative_and_commutative() {
    let samples = [
        TokenMetrics::new(0, 0, 0),
        TokenMetrics::new(12, 30, 450),
        TokenMetrics::new(7, 1, 3),
        TokenMetrics::new(1_000, 2_000, 90_000),
    ];
    for a in samples {
        for b in samples {
            assert_eq!(a.merge(b), b.merge(a));
            for c in samples {
                assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
            }
        }
        assert_eq!(a.merge(TokenMetrics::default()), a);
    }

    let total: TokenMetrics = samples.iter().copied().sum();
    assert_eq!(total.prompt_tokens, 1_019);
    assert_eq!(total.completion_tokens, 2_031);
    assert_eq!(total.total_tokens, 3_050);
    assert_eq!(total.cost_micros, 90_453);
}
