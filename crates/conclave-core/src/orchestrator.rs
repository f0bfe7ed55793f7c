//! The invocation surface: one object that owns the registries, storage,
//! runner and worker, and exposes run-level operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, Instrument};

use conclave_state::fakes::{MemoryCheckpointRepository, MemoryRunRepository};
use conclave_state::{CheckpointRepository, RunRepository, SurrealStore};

use crate::adapter::AdapterSet;
use crate::checkpoint::{CheckpointManager, DEFAULT_MAX_CHECKPOINTS};
use crate::collector::{JsonlFileBackend, TelemetryBackend, TelemetryCollector, TracingBackend};
use crate::config::{EngineConfig, StorageBackend};
use crate::dispatch::{PromptDispatcher, DEFAULT_AGENT_TIMEOUT};
use crate::domain::{
    AgentConfig, AgentRun, CandidateRecord, CheckpointId, CheckpointState, ConclaveError,
    DecisionRecord, Result, RunId, RunInput, RunStatus,
};
use crate::evaluator::{CommandEvaluator, EvaluatorRegistry, LlmEvaluator, MarkerEvaluator};
use crate::judge::{Judge, JudgeConfig};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::AgentRegistry;
use crate::runner::{PhaseRunner, PlanSource, RunOwner, RunnerPolicy};
use crate::worker::RunWorker;

const DEFAULT_CONCURRENCY: usize = 4;

/// Step-by-step construction of an [`Orchestrator`].
pub struct OrchestratorBuilder {
    agents: Vec<AgentConfig>,
    adapters: AdapterSet,
    plans: Option<Arc<dyn PlanSource>>,
    runs: Option<Arc<dyn RunRepository>>,
    checkpoints: Option<Arc<dyn CheckpointRepository>>,
    policy: RunnerPolicy,
    judge: JudgeConfig,
    max_checkpoints: usize,
    default_agent_timeout: Duration,
    concurrency: usize,
    telemetry: TelemetryCollector,
    owner: Option<Arc<dyn RunOwner>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            adapters: AdapterSet::standard(),
            plans: None,
            runs: None,
            checkpoints: None,
            policy: RunnerPolicy::default(),
            judge: JudgeConfig::default(),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            default_agent_timeout: DEFAULT_AGENT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            telemetry: TelemetryCollector::disabled(),
            owner: None,
        }
    }
}

impl OrchestratorBuilder {
    pub fn agents(mut self, agents: impl IntoIterator<Item = AgentConfig>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn adapters(mut self, adapters: AdapterSet) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn plans(mut self, plans: Arc<dyn PlanSource>) -> Self {
        self.plans = Some(plans);
        self
    }

    /// Storage for runs and checkpoints. Defaults to the in-memory repositories.
    pub fn storage(
        mut self,
        runs: Arc<dyn RunRepository>,
        checkpoints: Arc<dyn CheckpointRepository>,
    ) -> Self {
        self.runs = Some(runs);
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn policy(mut self, policy: RunnerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn judge(mut self, judge: JudgeConfig) -> Self {
        self.judge = judge;
        self
    }

    pub fn max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    pub fn default_agent_timeout(mut self, timeout: Duration) -> Self {
        self.default_agent_timeout = timeout;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn owner(mut self, owner: Arc<dyn RunOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Validate agents, wire the components together, and start the worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Orchestrator> {
        let plans = self
            .plans
            .ok_or_else(|| ConclaveError::Config("orchestrator needs a plan source".to_string()))?;

        let registry = Arc::new(AgentRegistry::new());
        registry.register_all(self.agents)?;

        let runs = self
            .runs
            .unwrap_or_else(|| Arc::new(MemoryRunRepository::new()));
        let checkpoint_repo = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(MemoryCheckpointRepository::new()));

        let dispatcher = Arc::new(
            PromptDispatcher::new(Arc::clone(&registry), self.adapters)
                .with_default_timeout(self.default_agent_timeout),
        );
        let evaluators = Arc::new(EvaluatorRegistry::new());
        let checkpoints = Arc::new(CheckpointManager::new(
            checkpoint_repo,
            Arc::clone(&runs),
            self.max_checkpoints,
        ));
        let judge = Arc::new(
            Judge::new(Arc::clone(&dispatcher), self.judge).with_telemetry(self.telemetry.clone()),
        );

        let mut runner = PhaseRunner::new(
            Arc::clone(&runs),
            Arc::clone(&checkpoints),
            Arc::clone(&dispatcher),
            Arc::clone(&evaluators),
            judge,
            plans,
        )
        .with_policy(self.policy)
        .with_telemetry(self.telemetry.clone());
        if let Some(owner) = self.owner {
            runner = runner.with_owner(owner);
        }
        let runner = Arc::new(runner);
        let worker = RunWorker::spawn(Arc::clone(&runner), self.concurrency);

        Ok(Orchestrator {
            registry,
            dispatcher,
            evaluators,
            runs,
            checkpoints,
            runner,
            worker,
            telemetry: self.telemetry,
        })
    }
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<PromptDispatcher>,
    evaluators: Arc<EvaluatorRegistry>,
    runs: Arc<dyn RunRepository>,
    checkpoints: Arc<CheckpointManager>,
    runner: Arc<PhaseRunner>,
    worker: RunWorker,
    telemetry: TelemetryCollector,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Build everything `config` describes: storage, telemetry backends,
    /// agents, evaluators and policy.
    pub async fn from_config(
        config: &EngineConfig,
        adapters: AdapterSet,
        plans: Arc<dyn PlanSource>,
    ) -> Result<Self> {
        config.validate()?;

        let mut backends: Vec<Arc<dyn TelemetryBackend>> = Vec::new();
        if let Some(path) = &config.telemetry.jsonl_path {
            backends.push(Arc::new(JsonlFileBackend::new(path)));
        }
        if config.telemetry.tracing {
            backends.push(Arc::new(TracingBackend));
        }

        let mut builder = Self::builder()
            .agents(config.agents.iter().cloned())
            .adapters(adapters)
            .plans(plans)
            .policy(config.runner_policy())
            .judge(config.judge_config())
            .max_checkpoints(config.max_checkpoints)
            .default_agent_timeout(config.default_agent_timeout())
            .concurrency(config.worker_concurrency)
            .telemetry(TelemetryCollector::new(backends));

        if config.storage.backend == StorageBackend::Surreal {
            let store = Arc::new(SurrealStore::connect(&config.storage.url).await?);
            builder = builder.storage(store.clone(), store);
        }

        let orchestrator = builder.build()?;

        let evaluation = &config.evaluation;
        for c in &evaluation.commands {
            let mut evaluator = CommandEvaluator::new(&c.name, &c.program)
                .with_args(c.args.iter().cloned())
                .with_timeout(Duration::from_millis(c.timeout_ms));
            if let Some(suffix) = &c.suffix {
                evaluator = evaluator.with_suffix(suffix);
            }
            orchestrator
                .evaluators
                .register(Arc::new(evaluator), c.phases.as_deref())?;
        }
        for m in &evaluation.markers {
            let mut evaluator = MarkerEvaluator::new(&m.name);
            for marker in &m.require {
                evaluator = evaluator.require(marker);
            }
            for marker in &m.forbid {
                evaluator = evaluator.forbid(marker);
            }
            orchestrator
                .evaluators
                .register(Arc::new(evaluator), m.phases.as_deref())?;
        }
        for l in &evaluation.llm {
            let mut evaluator = LlmEvaluator::new(
                &l.name,
                &l.agent,
                l.criteria.clone(),
                Arc::clone(&orchestrator.dispatcher),
            );
            if let Some(ms) = l.timeout_ms {
                evaluator = evaluator.with_timeout(Duration::from_millis(ms));
            }
            orchestrator
                .evaluators
                .register(Arc::new(evaluator), l.phases.as_deref())?;
        }

        info!(
            agents = orchestrator.registry.len(),
            evaluators = orchestrator.evaluators.len(),
            storage = ?config.storage.backend,
            "orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<PromptDispatcher> {
        &self.dispatcher
    }

    pub fn evaluators(&self) -> &Arc<EvaluatorRegistry> {
        &self.evaluators
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    /// Persist a new run in the `planned` state.
    pub async fn create_run(&self, input: RunInput) -> Result<AgentRun> {
        let run = AgentRun::new(input);
        self.runs.create_run(&run).await?;
        info!(run_id = %run.id, "run created");
        Ok(run)
    }

    /// Hand a planned run to the background worker.
    pub async fn start_run(&self, run_id: &RunId) -> Result<watch::Receiver<RunStatus>> {
        let run = self.runs.get_run(run_id).await?;
        if run.status != RunStatus::Planned {
            return Err(ConclaveError::InvalidState(format!(
                "run {run_id} is {}; only planned runs can be started",
                run.status
            )));
        }
        self.worker.enqueue(run.id).await
    }

    /// Execute a planned run on the caller's task.
    pub async fn run_to_completion(&self, run_id: &RunId) -> Result<AgentRun> {
        self.runner
            .execute(run_id)
            .instrument(obs::run_span(run_id.as_str()))
            .await
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<AgentRun> {
        Ok(self.runs.get_run(run_id).await?)
    }

    pub async fn get_run_status(&self, run_id: &RunId) -> Result<RunStatus> {
        Ok(self.get_run(run_id).await?.status)
    }

    pub async fn list_runs(&self) -> Result<Vec<AgentRun>> {
        Ok(self.runs.list_runs().await?)
    }

    pub async fn fork_run(
        &self,
        checkpoint_id: &CheckpointId,
        label: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<AgentRun> {
        self.checkpoints.fork(checkpoint_id, label, reason).await
    }

    pub async fn list_checkpoints(&self, run_id: &RunId) -> Result<Vec<CheckpointState>> {
        self.checkpoints.list(run_id).await
    }

    pub async fn restore_checkpoint(&self, id: &CheckpointId) -> Result<CheckpointState> {
        self.checkpoints.restore(id).await
    }

    pub async fn list_decisions(&self, run_id: &RunId) -> Result<Vec<DecisionRecord>> {
        Ok(self.runs.list_decisions(run_id).await?)
    }

    pub async fn list_candidates(&self, run_id: &RunId) -> Result<Vec<CandidateRecord>> {
        Ok(self.runs.list_candidates(run_id).await?)
    }

    /// Drain the worker, flush telemetry, and log the process counters.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
        self.telemetry.flush().await;
        METRICS.flush();
    }
}

/// Wait until the watched run reaches a terminal status.
///
/// Returns the last status seen if the worker drops the channel first.
pub async fn wait_for_terminal(mut status: watch::Receiver<RunStatus>) -> RunStatus {
    let seen = status.wait_for(RunStatus::is_terminal).await.map(|s| *s);
    match seen {
        Ok(s) => s,
        Err(_) => *status.borrow(),
    }
}
