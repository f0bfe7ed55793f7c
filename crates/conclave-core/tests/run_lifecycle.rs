//! End-to-end runs through planning, coding and verification against
//! scripted agents.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conclave_core::collector::MemoryBackend;
use conclave_core::domain::EvaluationResult;
use conclave_core::evaluator::EvaluationContext;
use conclave_core::fakes::{RecordingOwner, Script};
use conclave_core::{
    CheckpointStatus, ConclaveError, DecisionMethod, DispatchError, Evaluator, Phase, RunInput,
    RunStatus, StaticPlanSource, TelemetryBackend, TelemetryCollector,
};
use conclave_state::fakes::{MemoryCheckpointRepository, MemoryRunRepository};
use conclave_state::{
    AgentRun, CandidateRecord, DecisionRecord, RunId, RunRepository, StorageResult,
};

use common::{adapter, builder, judge_prefers, workers_reply, JUDGE, WORKERS};

#[tokio::test]
async fn test_three_phase_run_completes_with_one_decision_per_phase() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    judge_prefers(&adapter, "beta");
    let owner = Arc::new(RecordingOwner::new());
    let orchestrator = builder(Arc::clone(&adapter))
        .owner(owner.clone())
        .build()
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("write a lexer"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Planned);

    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(finished.failure_reason.is_none());
    assert!(finished.completed_at.is_some());

    let decisions = orchestrator.list_decisions(&run.id).await.unwrap();
    let phases: Vec<Phase> = decisions.iter().map(|d| d.phase).collect();
    assert_eq!(phases, Phase::ALL.to_vec());
    assert!(decisions.iter().all(|d| d.method == DecisionMethod::Judge));
    assert!(decisions[0].rationale.contains("helpfulness=0.8"));

    let candidates = orchestrator.list_candidates(&run.id).await.unwrap();
    assert_eq!(candidates.len(), 9);
    for decision in &decisions {
        let winner = candidates
            .iter()
            .find(|c| c.id == decision.candidate_id)
            .unwrap();
        assert_eq!(winner.agent_name, "beta");
        assert_eq!(winner.phase, decision.phase);
    }

    // 3 workers + 1 judge per phase, 15 tokens and 100 micros each.
    assert_eq!(finished.token_metrics.total_tokens, 180);
    assert_eq!(finished.token_metrics.cost_micros, 1_200);

    let checkpoints = orchestrator.list_checkpoints(&run.id).await.unwrap();
    let seqs: Vec<u64> = checkpoints.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert!(checkpoints
        .iter()
        .all(|c| c.status == CheckpointStatus::Completed));
    assert_eq!(checkpoints[2].token_metrics.total_tokens, 180);

    // Later phases see the selected earlier output.
    let alpha_calls: Vec<String> = adapter
        .calls()
        .into_iter()
        .filter(|c| c.agent == "alpha")
        .map(|c| c.prompt)
        .collect();
    assert_eq!(alpha_calls.len(), 3);
    assert!(alpha_calls[1].contains("beta: 1. write the lexer"));
    assert!(alpha_calls[2].contains("beta: fn lex()"));

    let notified = owner.finished();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].id, run.id);
}

#[tokio::test]
async fn test_verification_failures_exhaust_retries() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION FAILED: tests missing");
    judge_prefers(&adapter, "alpha");
    let orchestrator = builder(Arc::clone(&adapter))
        .policy(common::policy().with_max_retries(1))
        .build()
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("write a lexer"))
        .await
        .unwrap();
    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Failed);
    let reason = finished.failure_reason.unwrap();
    assert!(reason.contains("retries exhausted"), "{reason}");

    let decisions = orchestrator.list_decisions(&run.id).await.unwrap();
    let count = |p: Phase| decisions.iter().filter(|d| d.phase == p).count();
    assert_eq!(count(Phase::Planning), 1);
    assert_eq!(count(Phase::Coding), 2);
    assert_eq!(count(Phase::Verification), 2);

    // The second coding round carries the verifier's report.
    let coding_prompts: Vec<String> = adapter
        .calls()
        .into_iter()
        .filter(|c| c.agent == "alpha" && c.prompt.starts_with("# Coding phase"))
        .map(|c| c.prompt)
        .collect();
    assert_eq!(coding_prompts.len(), 2);
    assert!(!coding_prompts[0].contains("Feedback from previous attempts"));
    assert!(coding_prompts[1].contains("Feedback from previous attempts"));
    assert!(coding_prompts[1].contains("tests missing"));
}

#[tokio::test]
async fn test_retry_with_feedback_then_pass_completes() {
    let adapter = adapter();
    judge_prefers(&adapter, "gamma");
    for name in WORKERS {
        adapter.respond_with(name, move |prompt| {
            if prompt.starts_with("# Coding phase") {
                if prompt.contains("off by one") {
                    format!("{name}: fixed loop bound")
                } else {
                    format!("{name}: first loop")
                }
            } else if prompt.starts_with("# Verification phase") {
                if prompt.contains("fixed loop bound") {
                    "looks right now\nVERIFICATION PASSED".to_string()
                } else {
                    "VERIFICATION FAILED: off by one".to_string()
                }
            } else {
                format!("{name} plan")
            }
        });
    }
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();
    let run = orchestrator
        .create_run(RunInput::new("fix the loop"))
        .await
        .unwrap();

    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Completed);
    let decisions = orchestrator.list_decisions(&run.id).await.unwrap();
    let phases: Vec<Phase> = decisions.iter().map(|d| d.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Planning,
            Phase::Coding,
            Phase::Verification,
            Phase::Coding,
            Phase::Verification,
        ]
    );
    assert_eq!(decisions[3].attempt, 2);

    let checkpoints = orchestrator.list_checkpoints(&run.id).await.unwrap();
    assert_eq!(checkpoints.len(), 5);
    let context = &checkpoints[4].context;
    assert_eq!(context["verification_failures"], 1);
}

#[tokio::test]
async fn test_all_agents_failing_ends_run_without_judge() {
    let adapter = adapter();
    for name in WORKERS {
        adapter.fail(name, DispatchError::Provider("down".into()));
    }
    judge_prefers(&adapter, "alpha");
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();

    let run = orchestrator
        .create_run(RunInput::new("anything"))
        .await
        .unwrap();
    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Failed);
    let reason = finished.failure_reason.unwrap();
    assert!(reason.starts_with("zero candidates"), "{reason}");
    assert!(reason.contains("planning"));
    assert_eq!(adapter.call_count(JUDGE), 0);
    assert!(orchestrator
        .list_decisions(&run.id)
        .await
        .unwrap()
        .is_empty());

    let checkpoints = orchestrator.list_checkpoints(&run.id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].status, CheckpointStatus::Failed);
}

#[tokio::test]
async fn test_single_surviving_candidate_skips_judge() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    adapter
        .fail("beta", DispatchError::Timeout)
        .fail("gamma", DispatchError::Provider("quota".into()));
    judge_prefers(&adapter, "alpha");
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();

    let run = orchestrator
        .create_run(RunInput::new("solo"))
        .await
        .unwrap();
    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(adapter.call_count(JUDGE), 0);
    let decisions = orchestrator.list_decisions(&run.id).await.unwrap();
    assert!(decisions
        .iter()
        .all(|d| d.method == DecisionMethod::SingleCandidate));
}

#[tokio::test]
async fn test_unparseable_judge_falls_back_to_tie_break() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    adapter.reply(JUDGE, "I like the second one best.");
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();

    let run = orchestrator
        .create_run(RunInput::new("pick"))
        .await
        .unwrap();
    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);

    let decisions = orchestrator.list_decisions(&run.id).await.unwrap();
    let candidates = orchestrator.list_candidates(&run.id).await.unwrap();
    for decision in &decisions {
        assert_eq!(decision.method, DecisionMethod::TieBreak);
        assert_eq!(decision.score, 0.0);
        let winner = candidates
            .iter()
            .find(|c| c.id == decision.candidate_id)
            .unwrap();
        assert_eq!(winner.dispatch_index, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_fails_the_run() {
    let adapter = adapter();
    judge_prefers(&adapter, "alpha");
    for name in WORKERS {
        adapter
            .push(name, Script::Reply(format!("{name} plan")))
            .delay(name, Duration::from_secs(60), "too late");
    }
    let orchestrator = builder(Arc::clone(&adapter))
        .policy(common::policy().with_run_timeout(Duration::from_secs(5)))
        .build()
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("slow work"))
        .await
        .unwrap();
    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Failed);
    let reason = finished.failure_reason.unwrap();
    assert!(reason.starts_with("timeout"), "{reason}");
    assert!(reason.contains("coding"), "{reason}");

    let checkpoints = orchestrator.list_checkpoints(&run.id).await.unwrap();
    assert_eq!(checkpoints[0].status, CheckpointStatus::Completed);
    assert_eq!(checkpoints[1].status, CheckpointStatus::Failed);
}

#[tokio::test]
async fn test_missing_plan_fails_run_and_returns_error() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    let orchestrator = builder(Arc::clone(&adapter))
        .plans(Arc::new(StaticPlanSource::empty()))
        .build()
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("no plan"))
        .await
        .unwrap();
    let err = orchestrator.run_to_completion(&run.id).await.unwrap_err();
    assert!(err.is_not_found());

    let stored = orchestrator.get_run(&run.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert!(stored
        .failure_reason
        .unwrap()
        .starts_with("plan not found"));
    assert!(adapter.calls().is_empty());
}

#[tokio::test]
async fn test_terminal_run_cannot_be_executed_again() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    judge_prefers(&adapter, "alpha");
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();

    let run = orchestrator
        .create_run(RunInput::new("once"))
        .await
        .unwrap();
    orchestrator.run_to_completion(&run.id).await.unwrap();

    let err = orchestrator.run_to_completion(&run.id).await.unwrap_err();
    assert!(matches!(err, ConclaveError::InvalidState(_)));
}

#[tokio::test]
async fn test_fork_resumes_from_checkpoint_phase() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    judge_prefers(&adapter, "beta");
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();

    let parent = orchestrator
        .create_run(RunInput::new("write a lexer"))
        .await
        .unwrap();
    orchestrator.run_to_completion(&parent.id).await.unwrap();
    let parent_checkpoints = orchestrator.list_checkpoints(&parent.id).await.unwrap();
    let coding = parent_checkpoints
        .iter()
        .find(|c| c.phase == Phase::Coding)
        .unwrap();

    let fork = orchestrator
        .fork_run(&coding.id, "retry-coding", "try another approach")
        .await
        .unwrap();
    assert_eq!(fork.status, RunStatus::Planned);
    assert_eq!(fork.parent_run_id.as_ref(), Some(&parent.id));
    assert_eq!(fork.parent_checkpoint_id.as_ref(), Some(&coding.id));
    assert_eq!(fork.fork_label.as_deref(), Some("retry-coding"));
    assert_eq!(fork.current_phase, Some(Phase::Coding));

    let calls_before = adapter.calls().len();
    let finished = orchestrator.run_to_completion(&fork.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);

    let decisions = orchestrator.list_decisions(&fork.id).await.unwrap();
    let phases: Vec<Phase> = decisions.iter().map(|d| d.phase).collect();
    assert_eq!(phases, vec![Phase::Coding, Phase::Verification]);

    // The fork's coding prompt carries the parent's selected plan.
    let fork_calls = &adapter.calls()[calls_before..];
    assert!(fork_calls
        .iter()
        .filter(|c| c.agent == "gamma")
        .all(|c| !c.prompt.starts_with("# Planning phase")));
    assert!(fork_calls
        .iter()
        .any(|c| c.prompt.starts_with("# Coding phase")
            && c.prompt.contains("beta: 1. write the lexer")));

    let fork_checkpoints = orchestrator.list_checkpoints(&fork.id).await.unwrap();
    assert_eq!(fork_checkpoints.len(), 2);
    assert_eq!(
        fork_checkpoints[0].parent_checkpoint_id.as_ref(),
        Some(&coding.id)
    );

    // The parent is untouched.
    assert_eq!(
        orchestrator.list_checkpoints(&parent.id).await.unwrap(),
        parent_checkpoints
    );
    assert_eq!(
        orchestrator.list_decisions(&parent.id).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_telemetry_records_lifecycle_events() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    judge_prefers(&adapter, "alpha");
    let backend = Arc::new(MemoryBackend::new());
    let backends: Vec<Arc<dyn TelemetryBackend>> = vec![backend.clone()];
    let orchestrator = builder(Arc::clone(&adapter))
        .telemetry(TelemetryCollector::new(backends))
        .build()
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("observe me"))
        .await
        .unwrap();
    orchestrator.run_to_completion(&run.id).await.unwrap();
    orchestrator.shutdown().await;

    let events = backend.events();
    let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names.first(), Some(&"run.started"));
    assert_eq!(names.last(), Some(&"run.completed"));
    assert_eq!(names.iter().filter(|n| **n == "phase.decided").count(), 3);
    assert!(events
        .iter()
        .all(|e| e.trace_id.as_deref() == Some(run.id.as_str())));
}

struct BrokenLinter;

#[async_trait]
impl Evaluator for BrokenLinter {
    fn name(&self) -> &str {
        "broken-linter"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, _output: &str, _ctx: &EvaluationContext) -> EvaluationResult {
        panic!("linter crashed")
    }
}

#[tokio::test]
async fn test_panicking_evaluator_does_not_strand_the_run() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    judge_prefers(&adapter, "gamma");
    let orchestrator = builder(Arc::clone(&adapter)).build().unwrap();
    orchestrator
        .evaluators()
        .register(Arc::new(BrokenLinter), Some(&[Phase::Coding]))
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("lint me"))
        .await
        .unwrap();
    let finished = orchestrator.run_to_completion(&run.id).await.unwrap();
    assert!(finished.status.is_terminal());
    assert_eq!(finished.status, RunStatus::Completed);

    let coding: Vec<_> = orchestrator
        .list_candidates(&run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.phase == Phase::Coding)
        .collect();
    assert_eq!(coding.len(), 3);
    for candidate in &coding {
        let result = &candidate.evaluations[0];
        assert_eq!(result.evaluator_name, "broken-linter");
        assert!(!result.passed);
        assert!(result.criteria[0].detail.contains("linter crashed"));
    }
}

/// Run store whose reads suspend, like a networked database.
struct YieldingRuns(MemoryRunRepository);

#[async_trait]
impl RunRepository for YieldingRuns {
    async fn create_run(&self, run: &AgentRun) -> StorageResult<()> {
        self.0.create_run(run).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<AgentRun> {
        tokio::task::yield_now().await;
        self.0.get_run(run_id).await
    }

    async fn update_run(&self, run: &AgentRun) -> StorageResult<()> {
        tokio::task::yield_now().await;
        self.0.update_run(run).await
    }

    async fn list_runs(&self) -> StorageResult<Vec<AgentRun>> {
        self.0.list_runs().await
    }

    async fn upsert_candidate(&self, candidate: &CandidateRecord) -> StorageResult<()> {
        self.0.upsert_candidate(candidate).await
    }

    async fn list_candidates(&self, run_id: &RunId) -> StorageResult<Vec<CandidateRecord>> {
        self.0.list_candidates(run_id).await
    }

    async fn save_decision(&self, decision: &DecisionRecord) -> StorageResult<()> {
        self.0.save_decision(decision).await
    }

    async fn list_decisions(&self, run_id: &RunId) -> StorageResult<Vec<DecisionRecord>> {
        self.0.list_decisions(run_id).await
    }
}

#[tokio::test]
async fn test_concurrent_execution_of_one_run_is_rejected() {
    let adapter = adapter();
    workers_reply(&adapter, "VERIFICATION PASSED");
    judge_prefers(&adapter, "alpha");
    let orchestrator = builder(Arc::clone(&adapter))
        .storage(
            Arc::new(YieldingRuns(MemoryRunRepository::new())),
            Arc::new(MemoryCheckpointRepository::new()),
        )
        .build()
        .unwrap();

    let run = orchestrator
        .create_run(RunInput::new("only once"))
        .await
        .unwrap();
    let (first, second) = tokio::join!(
        orchestrator.run_to_completion(&run.id),
        orchestrator.run_to_completion(&run.id),
    );

    let outcomes = [first, second];
    let finished: Vec<&AgentRun> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, RunStatus::Completed);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(ConclaveError::InvalidState(_)))));

    // One planning decision, not two.
    let decisions = orchestrator.list_decisions(&run.id).await.unwrap();
    assert_eq!(decisions.len(), 3);
    assert_eq!(orchestrator.list_candidates(&run.id).await.unwrap().len(), 9);

    // The claim is released afterwards; the run is terminal now.
    let again = orchestrator.run_to_completion(&run.id).await.unwrap_err();
    assert!(matches!(again, ConclaveError::InvalidState(_)));
}
