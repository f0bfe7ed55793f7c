//! Record types and repository traits for Conclave.
//!
//! These traits define the persistence boundary of the orchestration core:
//! - `RunRepository`: runs, candidates and decisions
//! - `CheckpointRepository`: ordered per-run checkpoints
//!
//! All traits are async and backend-agnostic. In-memory fakes live in the
//! `fakes` module; a SurrealDB implementation lives in `surreal_store`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for an agent run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

/// Unique identifier for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    /// Generate a new random CheckpointId
    pub fn new() -> Self {
        CheckpointId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(s: &str) -> Self {
        CheckpointId(s.to_string())
    }
}

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Shared vocabulary
// ---------------------------------------------------------------------------

/// A named stage of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Coding,
    Verification,
}

impl Phase {
    /// Every phase in execution order.
    pub const ALL: [Phase; 3] = [Phase::Planning, Phase::Coding, Phase::Verification];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Coding => "coding",
            Phase::Verification => "verification",
        }
    }

    /// The phase that follows this one on the success path.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Planning => Some(Phase::Coding),
            Phase::Coding => Some(Phase::Verification),
            Phase::Verification => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" => Ok(Phase::Planning),
            "coding" => Ok(Phase::Coding),
            "verification" => Ok(Phase::Verification),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Aggregated token usage and cost.
///
/// Cost is tracked in millionths of a currency unit so that [`TokenMetrics::merge`]
/// stays exactly associative and commutative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_micros: u64,
}

impl TokenMetrics {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, cost_micros: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_micros,
        }
    }

    /// Component-wise sum of two metric sets.
    pub fn merge(self, other: TokenMetrics) -> TokenMetrics {
        TokenMetrics {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
            cost_micros: self.cost_micros.saturating_add(other.cost_micros),
        }
    }

    /// In-place variant of [`TokenMetrics::merge`].
    pub fn accumulate(&mut self, other: TokenMetrics) {
        *self = self.merge(other);
    }

    /// Cost expressed in whole currency units.
    pub fn cost(&self) -> f64 {
        self.cost_micros as f64 / 1_000_000.0
    }

    pub fn is_zero(&self) -> bool {
        *self == TokenMetrics::default()
    }
}

impl std::iter::Sum for TokenMetrics {
    fn sum<I: Iterator<Item = TokenMetrics>>(iter: I) -> Self {
        iter.fold(TokenMetrics::default(), TokenMetrics::merge)
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planned,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Planned => "planned",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One prior turn of the conversation that produced the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Input supplied when a run is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunInput {
    /// The user's task message.
    pub message: String,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    /// Free-form metadata (plan reference, owning sprint id, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RunInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history = history;
        self
    }

    /// Look up a string field in `metadata`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A single orchestration run. Forks point back at their source run and checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub parent_run_id: Option<RunId>,
    pub parent_checkpoint_id: Option<CheckpointId>,
    pub fork_label: Option<String>,
    pub fork_reason: Option<String>,
    pub status: RunStatus,
    pub current_phase: Option<Phase>,
    pub failure_reason: Option<String>,
    pub input: RunInput,
    pub token_metrics: TokenMetrics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl AgentRun {
    /// Create a new run in the `Planned` state.
    pub fn new(input: RunInput) -> Self {
        Self {
            id: RunId::new(),
            parent_run_id: None,
            parent_checkpoint_id: None,
            fork_label: None,
            fork_reason: None,
            status: RunStatus::Planned,
            current_phase: None,
            failure_reason: None,
            input,
            token_metrics: TokenMetrics::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn is_fork(&self) -> bool {
        self.parent_run_id.is_some()
    }
}

// ---------------------------------------------------------------------------
// Evaluations, candidates, decisions
// ---------------------------------------------------------------------------

/// Whether an evaluator is a reproducible check or an LLM verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationCategory {
    Deterministic,
    Llm,
}

/// Outcome of a single criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl CriterionResult {
    pub fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Output of one evaluator applied to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluator_name: String,
    pub category: EvaluationCategory,
    pub criteria: Vec<CriterionResult>,
    /// True iff there is at least one criterion and all of them passed.
    pub passed: bool,
}

impl EvaluationResult {
    /// Build a result, deriving `passed` from the criteria.
    pub fn from_criteria(
        evaluator_name: impl Into<String>,
        category: EvaluationCategory,
        criteria: Vec<CriterionResult>,
    ) -> Self {
        let passed = !criteria.is_empty() && criteria.iter().all(|c| c.passed);
        Self {
            evaluator_name: evaluator_name.into(),
            category,
            criteria,
            passed,
        }
    }

    pub fn failed_criteria(&self) -> impl Iterator<Item = &CriterionResult> {
        self.criteria.iter().filter(|c| !c.passed)
    }
}

/// One agent's output for one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: String,
    pub run_id: RunId,
    pub phase: Phase,
    /// Execution attempt of `phase` within the run (starts at 1).
    pub attempt: u32,
    /// Position of the agent in the dispatch request.
    pub dispatch_index: usize,
    pub agent_name: String,
    pub provider: String,
    pub model_name: String,
    pub output: String,
    pub output_digest: ContentDigest,
    pub usage: TokenMetrics,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub evaluations: Vec<EvaluationResult>,
}

impl CandidateRecord {
    /// Whether every deterministic evaluation passed (vacuously true if none ran).
    pub fn passed_deterministic(&self) -> bool {
        self.evaluations
            .iter()
            .filter(|e| e.category == EvaluationCategory::Deterministic)
            .all(|e| e.passed)
    }

    pub fn passed_all(&self) -> bool {
        self.evaluations.iter().all(|e| e.passed)
    }
}

/// How a decision's winner was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    Judge,
    TieBreak,
    SingleCandidate,
}

/// The selected candidate for a completed phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub run_id: RunId,
    pub phase: Phase,
    pub attempt: u32,
    pub candidate_id: String,
    pub score: f64,
    pub rationale: String,
    /// Judge model, or a marker for non-judge selection.
    pub model_name: String,
    pub method: DecisionMethod,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Status of a checkpoint. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Completed | CheckpointStatus::Failed)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Running => "running",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of run progress at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub id: CheckpointId,
    pub run_id: RunId,
    /// Monotonic position within the run; never reused after eviction.
    pub seq: u64,
    pub phase: Phase,
    pub status: CheckpointStatus,
    pub phase_start_time: Option<DateTime<Utc>>,
    pub phase_end_time: Option<DateTime<Utc>>,
    pub token_metrics: TokenMetrics,
    pub parent_checkpoint_id: Option<CheckpointId>,
    pub failure_reason: Option<String>,
    /// Phase context carried forward (selected candidates so far).
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Repository traits
// ---------------------------------------------------------------------------

/// Persistence for runs and the candidates/decisions they produce.
///
/// Guarantees:
/// - `create_run` rejects duplicate ids with `AlreadyExists`.
/// - Candidates are listed in insertion order; `upsert_candidate` replaces by id.
/// - Decisions are write-once and listed in insertion order.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &AgentRun) -> StorageResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<AgentRun>;

    /// Replace a stored run. Fails with `NotFound` if it was never created.
    async fn update_run(&self, run: &AgentRun) -> StorageResult<()>;

    /// All runs, oldest first.
    async fn list_runs(&self) -> StorageResult<Vec<AgentRun>>;

    async fn upsert_candidate(&self, candidate: &CandidateRecord) -> StorageResult<()>;

    async fn list_candidates(&self, run_id: &RunId) -> StorageResult<Vec<CandidateRecord>>;

    async fn save_decision(&self, decision: &DecisionRecord) -> StorageResult<()>;

    async fn list_decisions(&self, run_id: &RunId) -> StorageResult<Vec<DecisionRecord>>;
}

/// Persistence for checkpoints.
///
/// Guarantees:
/// - `list_checkpoints` is ordered by `seq` ascending.
/// - `insert_checkpoint` rejects duplicate ids with `AlreadyExists`.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn insert_checkpoint(&self, checkpoint: &CheckpointState) -> StorageResult<()>;

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<CheckpointState>;

    async fn update_checkpoint(&self, checkpoint: &CheckpointState) -> StorageResult<()>;

    async fn delete_checkpoint(&self, id: &CheckpointId) -> StorageResult<()>;

    async fn list_checkpoints(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointState>>;
}
