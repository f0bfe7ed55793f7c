//! Domain models for Conclave.
//!
//! - `AgentConfig`: how to reach an agent
//! - `AgentResponse`: one agent's answer to one dispatched prompt
//! - `ConclaveError` / `DispatchError`: error taxonomy
//! - `FailureReason`: why a run failed
//!
//! Persisted records (runs, candidates, decisions, checkpoints) live in
//! `conclave-state` and are re-exported here.

pub mod agent;
pub mod error;

pub use agent::{AdapterOutput, AgentConfig, AgentResponse, IntegrationType, ToolCall};
pub use error::{ConclaveError, DispatchError, FailureReason, Result};

pub use conclave_state::{
    AgentRun, CandidateRecord, CheckpointId, CheckpointState, CheckpointStatus, ContentDigest,
    CriterionResult, DecisionMethod, DecisionRecord, EvaluationCategory, EvaluationResult,
    HistoryMessage, Phase, RunId, RunInput, RunStatus, TokenMetrics,
};
