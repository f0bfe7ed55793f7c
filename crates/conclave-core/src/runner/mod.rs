//! The phase state machine.
//!
//! A run moves `planned -> running(planning) -> running(coding) ->
//! running(verification) -> completed | failed`. Inside each phase the
//! runner walks `dispatching -> evaluating -> judging -> decided`:
//!
//! 1. build the phase prompt (plan, task, earlier selections, feedback)
//! 2. open a `running` checkpoint
//! 3. fan the prompt out to the phase's agents
//! 4. run evaluators over the successful responses
//! 5. let the judge pick a winner and persist the decision
//! 6. complete the checkpoint with the token delta and the new context
//!
//! A failed verification loops back to coding with the verifier's report in
//! feedback memory until `max_retries` is spent. Phases never overlap: the
//! next one starts only after the previous decision is stored.

pub mod context;
pub mod plan;
pub mod prompts;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use conclave_state::RunRepository;

use crate::checkpoint::{CheckpointManager, CheckpointSeed};
use crate::collector::{TelemetryCollector, TelemetryEvent};
use crate::dispatch::PromptDispatcher;
use crate::domain::{
    AgentResponse, AgentRun, CandidateRecord, CheckpointState, CheckpointStatus, ConclaveError,
    ContentDigest, FailureReason, Phase, Result, RunId, RunStatus, TokenMetrics,
};
use crate::evaluator::EvaluatorRegistry;
use crate::feedback::{AttemptRecord, FeedbackMemory};
use crate::judge::{Judge, JudgeRequest};
use crate::metrics::METRICS;
use crate::obs;

pub use context::{PhaseContext, PhaseSelection};
pub use plan::{FilePlanSource, PlanSource, StaticPlanSource};
pub use prompts::{build_phase_prompt, PromptInputs};

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_FEEDBACK_ATTEMPTS: usize = 3;
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SUCCESS_MARKER: &str = "VERIFICATION PASSED";
pub const DEFAULT_FAILURE_MARKER: &str = "VERIFICATION FAILED";

/// Notified once when a run reaches a terminal state, e.g. so an owning
/// sprint can transition.
#[async_trait]
pub trait RunOwner: Send + Sync {
    async fn run_finished(&self, run: &AgentRun);
}

/// Substates of a single phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStage {
    Dispatching,
    Evaluating,
    Judging,
    Decided,
}

impl PhaseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStage::Dispatching => "dispatching",
            PhaseStage::Evaluating => "evaluating",
            PhaseStage::Judging => "judging",
            PhaseStage::Decided => "decided",
        }
    }
}

/// Agent set and dispatch budget for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSettings {
    /// Agents to dispatch to. Empty means every registered agent.
    pub agents: Vec<String>,
    pub dispatch_timeout: Duration,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            dispatch_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerPolicy {
    /// Extra verification rounds allowed after the first failure.
    pub max_retries: u32,
    /// Failed attempts remembered per phase and replayed into retry prompts.
    pub feedback_attempts: usize,
    pub success_marker: String,
    pub failure_marker: String,
    /// Treat verification output with neither marker as a failure.
    pub require_success_marker: bool,
    /// Run LLM evaluators and judge candidates that failed deterministic checks.
    pub evaluate_llm_on_deterministic_failure: bool,
    /// Wall-clock budget for the whole run.
    pub run_timeout: Option<Duration>,
    pub phases: HashMap<Phase, PhaseSettings>,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            feedback_attempts: DEFAULT_FEEDBACK_ATTEMPTS,
            success_marker: DEFAULT_SUCCESS_MARKER.to_string(),
            failure_marker: DEFAULT_FAILURE_MARKER.to_string(),
            require_success_marker: false,
            evaluate_llm_on_deterministic_failure: false,
            run_timeout: None,
            phases: HashMap::new(),
        }
    }
}

impl RunnerPolicy {
    pub fn phase(&self, phase: Phase) -> PhaseSettings {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_phase_agents<I, S>(mut self, phase: Phase, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases.entry(phase).or_default().agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_phase_timeout(mut self, phase: Phase, timeout: Duration) -> Self {
        self.phases.entry(phase).or_default().dispatch_timeout = timeout;
        self
    }
}

/// Outcome of checking the verification winner for markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationVerdict {
    Passed,
    /// Carries the verifier's report.
    Failed(String),
}

/// The failure marker wins over the success marker when both appear.
pub fn verification_verdict(output: &str, policy: &RunnerPolicy) -> VerificationVerdict {
    if output.contains(policy.failure_marker.as_str()) {
        return VerificationVerdict::Failed(output.trim().to_string());
    }
    if output.contains(policy.success_marker.as_str()) || !policy.require_success_marker {
        return VerificationVerdict::Passed;
    }
    VerificationVerdict::Failed(format!(
        "verifier reply contained neither `{}` nor `{}`",
        policy.success_marker, policy.failure_marker
    ))
}

enum PhaseOutcome {
    Decided(Box<CandidateRecord>),
    Failed(FailureReason),
}

struct PhaseJob<'a> {
    phase: Phase,
    attempt: u32,
    plan: &'a str,
    deadline: Option<Instant>,
}

/// Runs currently inside [`PhaseRunner::execute`] on this runner.
///
/// Claiming happens before the stored status is read, so two callers racing
/// on the same `planned` run cannot both start it.
#[derive(Debug, Default)]
struct ActiveRuns {
    ids: Mutex<HashSet<RunId>>,
}

impl ActiveRuns {
    fn claim(&self, run_id: &RunId) -> Result<RunClaim<'_>> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(run_id.clone()) {
            return Err(ConclaveError::InvalidState(format!(
                "run {run_id} is already being executed"
            )));
        }
        Ok(RunClaim {
            active: self,
            run_id: run_id.clone(),
        })
    }
}

struct RunClaim<'a> {
    active: &'a ActiveRuns,
    run_id: RunId,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.active
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

pub struct PhaseRunner {
    runs: Arc<dyn RunRepository>,
    checkpoints: Arc<CheckpointManager>,
    dispatcher: Arc<PromptDispatcher>,
    evaluators: Arc<EvaluatorRegistry>,
    judge: Arc<Judge>,
    plans: Arc<dyn PlanSource>,
    policy: RunnerPolicy,
    telemetry: TelemetryCollector,
    owner: Option<Arc<dyn RunOwner>>,
    active: ActiveRuns,
}

impl PhaseRunner {
    pub fn new(
        runs: Arc<dyn RunRepository>,
        checkpoints: Arc<CheckpointManager>,
        dispatcher: Arc<PromptDispatcher>,
        evaluators: Arc<EvaluatorRegistry>,
        judge: Arc<Judge>,
        plans: Arc<dyn PlanSource>,
    ) -> Self {
        Self {
            runs,
            checkpoints,
            dispatcher,
            evaluators,
            judge,
            plans,
            policy: RunnerPolicy::default(),
            telemetry: TelemetryCollector::disabled(),
            owner: None,
            active: ActiveRuns::default(),
        }
    }

    pub fn with_policy(mut self, policy: RunnerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_owner(mut self, owner: Arc<dyn RunOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn policy(&self) -> &RunnerPolicy {
        &self.policy
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn runs(&self) -> &Arc<dyn RunRepository> {
        &self.runs
    }

    /// Drive `run_id` to a terminal state.
    ///
    /// A run that fails for a run-level reason (timeout, exhausted retries,
    /// zero candidates) comes back as `Ok` with status `failed`. Errors are
    /// returned for a missing run or plan, a run that is already running or
    /// terminal, and storage failures; the run is marked failed first when
    /// possible.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn execute(&self, run_id: &RunId) -> Result<AgentRun> {
        let _claim = self.active.claim(run_id)?;
        let result = self.execute_claimed(run_id).await;
        self.checkpoints.release(run_id);
        result
    }

    async fn execute_claimed(&self, run_id: &RunId) -> Result<AgentRun> {
        let mut run = self.runs.get_run(run_id).await?;
        if run.status != RunStatus::Planned {
            return Err(ConclaveError::InvalidState(format!(
                "run {run_id} is {} and cannot be executed",
                run.status
            )));
        }

        let clock = Instant::now();
        let deadline = self.policy.run_timeout.map(|t| clock + t);

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run.current_phase = Some(run.current_phase.unwrap_or(Phase::Planning));
        self.runs.update_run(&run).await?;

        obs::emit_run_started(run.id.as_str(), run.is_fork());
        self.telemetry.record(
            TelemetryEvent::new("run.started")
                .with_trace(run.id.as_str())
                .with_attr("fork", run.is_fork()),
        );

        let plan = match self.plans.resolve_plan(&run).await {
            Ok(plan) => plan,
            Err(err) => {
                let reason = if err.is_not_found() {
                    FailureReason::PlanNotFound {
                        detail: err.to_string(),
                    }
                } else {
                    FailureReason::Internal {
                        detail: err.to_string(),
                    }
                };
                self.finish(&mut run, clock, Some(reason)).await?;
                return Err(err);
            }
        };

        match self.drive(&mut run, &plan, deadline).await {
            Ok(failure) => {
                self.finish(&mut run, clock, failure).await?;
                Ok(run)
            }
            Err(err) => {
                let reason = FailureReason::Internal {
                    detail: err.to_string(),
                };
                if let Err(finish_err) = self.finish(&mut run, clock, Some(reason)).await {
                    warn!(error = %finish_err, "could not record run failure");
                }
                Err(err)
            }
        }
    }

    /// The phase loop. `Ok(None)` means verification passed.
    async fn drive(
        &self,
        run: &mut AgentRun,
        plan: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<FailureReason>> {
        // A fork starts from a pending checkpoint carrying the source context.
        let mut resume = self
            .checkpoints
            .latest(&run.id)
            .await?
            .filter(|cp| cp.status == CheckpointStatus::Pending);
        let mut context = resume
            .as_ref()
            .map(|cp| PhaseContext::from_value(&cp.context))
            .unwrap_or_default();

        let mut feedback = FeedbackMemory::new(self.policy.feedback_attempts);
        let mut attempts: HashMap<Phase, u32> = HashMap::new();
        let mut winners: HashMap<Phase, CandidateRecord> = HashMap::new();
        let mut phase = run.current_phase.unwrap_or(Phase::Planning);

        loop {
            let attempt = {
                let n = attempts.entry(phase).or_insert(0);
                *n += 1;
                *n
            };
            let job = PhaseJob {
                phase,
                attempt,
                plan,
                deadline,
            };
            let resume_here = resume.take().filter(|cp| cp.phase == phase);

            let winner = match self
                .run_phase(run, job, resume_here, &mut context, &feedback)
                .await?
            {
                PhaseOutcome::Decided(winner) => *winner,
                PhaseOutcome::Failed(reason) => return Ok(Some(reason)),
            };

            if let Some(next) = phase.next() {
                winners.insert(phase, winner);
                phase = next;
                continue;
            }

            match verification_verdict(&winner.output, &self.policy) {
                VerificationVerdict::Passed => return Ok(None),
                VerificationVerdict::Failed(report) => {
                    context.verification_failures += 1;
                    let failures = context.verification_failures;
                    let retrying = failures <= self.policy.max_retries;
                    obs::emit_verification_failed(run.id.as_str(), failures, retrying);
                    self.telemetry.record(
                        TelemetryEvent::new("verification.failed")
                            .warn()
                            .with_trace(run.id.as_str())
                            .with_attr("attempt", failures)
                            .with_attr("retrying", retrying),
                    );
                    if !retrying {
                        return Ok(Some(FailureReason::RetriesExhausted { attempts: failures }));
                    }

                    METRICS.inc_verification_retries();
                    let (output, evaluations) = match winners.get(&Phase::Coding) {
                        Some(c) => (c.output.clone(), c.evaluations.clone()),
                        None => (
                            context.output(Phase::Coding).unwrap_or_default().to_string(),
                            Vec::new(),
                        ),
                    };
                    feedback.record(
                        Phase::Coding,
                        AttemptRecord::new(output, evaluations).with_note(report),
                    );
                    phase = Phase::Coding;
                }
            }
        }
    }

    /// Open the phase checkpoint, run the phase, and fail the checkpoint if
    /// the phase errors out.
    async fn run_phase(
        &self,
        run: &mut AgentRun,
        job: PhaseJob<'_>,
        resume: Option<CheckpointState>,
        context: &mut PhaseContext,
        feedback: &FeedbackMemory,
    ) -> Result<PhaseOutcome> {
        run.current_phase = Some(job.phase);
        self.runs.update_run(run).await?;

        let checkpoint = match resume {
            Some(cp) => {
                self.checkpoints
                    .update(&cp.id, CheckpointStatus::Running, TokenMetrics::default())
                    .await?
            }
            None => {
                self.checkpoints
                    .create_with(
                        &run.id,
                        job.phase,
                        CheckpointStatus::Running,
                        CheckpointSeed {
                            parent_checkpoint_id: None,
                            token_metrics: run.token_metrics,
                            context: context.to_value(),
                        },
                    )
                    .await?
            }
        };

        let result = self
            .phase_body(run, &job, &checkpoint, context, feedback)
            .await;
        if let Err(err) = &result {
            if let Err(fail_err) = self.checkpoints.fail(&checkpoint.id, err.to_string()).await {
                warn!(checkpoint = %checkpoint.id, error = %fail_err, "could not fail checkpoint");
            }
        }
        result
    }

    async fn phase_body(
        &self,
        run: &mut AgentRun,
        job: &PhaseJob<'_>,
        checkpoint: &CheckpointState,
        context: &mut PhaseContext,
        feedback: &FeedbackMemory,
    ) -> Result<PhaseOutcome> {
        let phase = job.phase;
        let settings = self.policy.phase(phase);

        if deadline_passed(job.deadline) {
            return self
                .fail_phase(run, checkpoint, TokenMetrics::default(), self.timeout_reason(phase))
                .await;
        }

        let rendered = feedback.render_feedback(phase, self.policy.feedback_attempts);
        let prompt = build_phase_prompt(
            phase,
            PromptInputs {
                input: &run.input,
                plan: job.plan,
                context,
                feedback: rendered.as_deref(),
                success_marker: &self.policy.success_marker,
                failure_marker: &self.policy.failure_marker,
            },
        );

        // dispatching
        self.stage(&run.id, phase, job.attempt, PhaseStage::Dispatching);
        let phase_deadline = Instant::now() + settings.dispatch_timeout;
        let batch_deadline = job.deadline.map_or(phase_deadline, |d| d.min(phase_deadline));
        let agents = (!settings.agents.is_empty()).then_some(settings.agents.as_slice());
        let responses = self
            .dispatcher
            .dispatch_until(&prompt, agents, batch_deadline)
            .await?;

        let attempted = responses.len();
        let mut usage: TokenMetrics = responses.iter().map(|r| r.usage).sum();
        let mut candidates = Vec::with_capacity(attempted);
        for (index, response) in responses.into_iter().enumerate() {
            match &response.error {
                Some(error) => {
                    warn!(agent = %response.agent_name, phase = %phase, error = %error, "agent failed");
                }
                None => candidates.push(candidate_from(&run.id, phase, job.attempt, index, response)),
            }
        }
        for candidate in &candidates {
            self.runs.upsert_candidate(candidate).await?;
        }

        if deadline_passed(job.deadline) {
            return self
                .fail_phase(run, checkpoint, usage, self.timeout_reason(phase))
                .await;
        }
        if candidates.is_empty() {
            return self
                .fail_phase(
                    run,
                    checkpoint,
                    usage,
                    FailureReason::ZeroCandidates { phase, attempted },
                )
                .await;
        }

        // evaluating
        self.stage(&run.id, phase, job.attempt, PhaseStage::Evaluating);
        self.evaluators
            .evaluate_candidates(
                phase,
                &run.input.message,
                &mut candidates,
                self.policy.evaluate_llm_on_deterministic_failure,
            )
            .await;
        for candidate in &candidates {
            self.runs.upsert_candidate(candidate).await?;
        }
        if deadline_passed(job.deadline) {
            return self
                .fail_phase(run, checkpoint, usage, self.timeout_reason(phase))
                .await;
        }

        // judging
        self.stage(&run.id, phase, job.attempt, PhaseStage::Judging);
        let pool = self.judge_pool(&candidates);
        let outcome = self
            .judge
            .decide(JudgeRequest {
                run_id: &run.id,
                phase,
                attempt: job.attempt,
                task: &run.input.message,
                candidates: &pool,
                deadline: job.deadline,
            })
            .await?;
        usage.accumulate(outcome.usage);
        let decision = outcome.decision;
        self.runs.save_decision(&decision).await?;

        let winner = candidates
            .into_iter()
            .find(|c| c.id == decision.candidate_id)
            .ok_or_else(|| ConclaveError::PhaseFatal {
                phase,
                reason: format!("decision names unknown candidate {}", decision.candidate_id),
            })?;

        // decided
        context.select(phase, job.attempt, &winner);
        self.checkpoints
            .set_context(&checkpoint.id, context.to_value())
            .await?;
        self.checkpoints
            .update(&checkpoint.id, CheckpointStatus::Completed, usage)
            .await?;
        run.token_metrics.accumulate(usage);
        self.runs.update_run(run).await?;

        self.stage(&run.id, phase, job.attempt, PhaseStage::Decided);
        obs::emit_phase_decided(
            run.id.as_str(),
            phase,
            &winner.id,
            decision.method,
            decision.score,
        );
        self.telemetry.record(
            TelemetryEvent::new("phase.decided")
                .with_trace(run.id.as_str())
                .with_span(checkpoint.id.as_str())
                .with_attr("phase", phase.as_str())
                .with_attr("attempt", job.attempt)
                .with_attr("candidate_id", winner.id.as_str())
                .with_attr("agent", winner.agent_name.as_str())
                .with_attr("score", decision.score)
                .with_attr("total_tokens", usage.total_tokens),
        );
        Ok(PhaseOutcome::Decided(Box::new(winner)))
    }

    /// Candidates the judge gets to see.
    fn judge_pool(&self, candidates: &[CandidateRecord]) -> Vec<CandidateRecord> {
        if self.policy.evaluate_llm_on_deterministic_failure {
            return candidates.to_vec();
        }
        let passed: Vec<CandidateRecord> = candidates
            .iter()
            .filter(|c| c.passed_deterministic())
            .cloned()
            .collect();
        if passed.is_empty() {
            debug!("no candidate passed deterministic checks; judging all");
            candidates.to_vec()
        } else {
            passed
        }
    }

    async fn fail_phase(
        &self,
        run: &mut AgentRun,
        checkpoint: &CheckpointState,
        usage: TokenMetrics,
        reason: FailureReason,
    ) -> Result<PhaseOutcome> {
        if !usage.is_zero() {
            self.checkpoints
                .update(&checkpoint.id, CheckpointStatus::Running, usage)
                .await?;
        }
        self.checkpoints
            .fail(&checkpoint.id, reason.to_string())
            .await?;
        run.token_metrics.accumulate(usage);
        warn!(phase = %checkpoint.phase, reason = %reason, "phase failed");
        self.telemetry.record(
            TelemetryEvent::new("phase.failed")
                .warn()
                .with_trace(run.id.as_str())
                .with_span(checkpoint.id.as_str())
                .with_attr("phase", checkpoint.phase.as_str())
                .with_error(reason.to_string()),
        );
        Ok(PhaseOutcome::Failed(reason))
    }

    fn timeout_reason(&self, phase: Phase) -> FailureReason {
        FailureReason::Timeout {
            phase,
            limit_ms: self
                .policy
                .run_timeout
                .map_or(0, |t| t.as_millis() as u64),
        }
    }

    fn stage(&self, run_id: &RunId, phase: Phase, attempt: u32, stage: PhaseStage) {
        obs::emit_phase_stage(run_id.as_str(), phase, attempt, stage.as_str());
        self.telemetry.record(
            TelemetryEvent::new("phase.stage")
                .with_trace(run_id.as_str())
                .with_attr("phase", phase.as_str())
                .with_attr("attempt", attempt)
                .with_attr("stage", stage.as_str()),
        );
    }

    async fn finish(
        &self,
        run: &mut AgentRun,
        clock: Instant,
        failure: Option<FailureReason>,
    ) -> Result<()> {
        let success = failure.is_none();
        run.status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        run.failure_reason = failure.map(|r| r.to_string());
        run.completed_at = Some(Utc::now());
        run.duration_ms = Some(clock.elapsed().as_millis() as u64);
        self.runs.update_run(run).await?;

        METRICS.inc_runs_finished(success);
        obs::emit_run_finished(
            run.id.as_str(),
            run.duration_ms.unwrap_or_default(),
            success,
            run.failure_reason.as_deref(),
        );
        let mut event = TelemetryEvent::new(if success { "run.completed" } else { "run.failed" })
            .with_trace(run.id.as_str())
            .with_duration(run.duration_ms.unwrap_or_default())
            .with_attr("total_tokens", run.token_metrics.total_tokens)
            .with_attr("cost_micros", run.token_metrics.cost_micros);
        if let Some(reason) = &run.failure_reason {
            event = event.warn().with_error(reason.as_str());
        }
        self.telemetry.record(event);

        if success {
            info!(tokens = run.token_metrics.total_tokens, "run completed");
        }
        if let Some(owner) = &self.owner {
            owner.run_finished(run).await;
        }
        Ok(())
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn candidate_from(
    run_id: &RunId,
    phase: Phase,
    attempt: u32,
    dispatch_index: usize,
    response: AgentResponse,
) -> CandidateRecord {
    CandidateRecord {
        id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.clone(),
        phase,
        attempt,
        dispatch_index,
        agent_name: response.agent_name,
        provider: response.provider,
        model_name: response.model_name,
        output_digest: ContentDigest::from_bytes(response.output.as_bytes()),
        output: response.output,
        usage: response.usage,
        started_at: response.started_at,
        completed_at: response.completed_at,
        duration_ms: response.duration_ms,
        evaluations: Vec::new(),
    }
}
