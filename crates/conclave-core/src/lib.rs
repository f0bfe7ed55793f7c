//! Conclave Core Library
//!
//! Sends the same task to several agents at once, scores their answers,
//! lets a judge pick one, and drives a planning → coding → verification
//! state machine with checkpoints, forks and bounded retries.

pub mod adapter;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod evaluator;
pub mod fakes;
pub mod feedback;
pub mod judge;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod telemetry;
pub mod worker;

pub use domain::{
    AdapterOutput, AgentConfig, AgentResponse, AgentRun, CandidateRecord, CheckpointId,
    CheckpointState, CheckpointStatus, ConclaveError, DecisionMethod, DecisionRecord,
    DispatchError, FailureReason, IntegrationType, Phase, Result, RunId, RunInput, RunStatus,
    TokenMetrics,
};

pub use adapter::{AdapterSet, CapabilityAdapter, CliAdapter, HttpAdapter, SdkAdapter};
pub use checkpoint::{CheckpointManager, DEFAULT_MAX_CHECKPOINTS};
pub use collector::{
    JsonlFileBackend, MemoryBackend, TelemetryBackend, TelemetryCollector, TelemetryEvent,
    TracingBackend,
};
pub use config::EngineConfig;
pub use dispatch::PromptDispatcher;
pub use evaluator::{
    CommandEvaluator, Evaluator, EvaluatorRegistry, LlmEvaluator, MarkerEvaluator,
};
pub use feedback::{AttemptRecord, FeedbackMemory};
pub use judge::{Judge, JudgeConfig};
pub use orchestrator::{wait_for_terminal, Orchestrator, OrchestratorBuilder};
pub use registry::{AgentFilter, AgentRegistry};
pub use runner::{
    FilePlanSource, PhaseRunner, PlanSource, RunOwner, RunnerPolicy, StaticPlanSource,
};
pub use worker::RunWorker;

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// Conclave version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
