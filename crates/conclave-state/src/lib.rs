//! Conclave-State: persistence boundary for the Conclave orchestration core
//!
//! The orchestration engine never talks to a storage engine directly. It
//! reads and writes records through two repository traits:
//!
//! - `RunRepository`: runs, candidate outputs and judge decisions
//! - `CheckpointRepository`: ordered per-run checkpoints
//!
//! ## Key Components
//!
//! - `storage_traits`: record types shared with the core and the traits
//! - `fakes`: in-memory implementations
//! - `SurrealStore`: SurrealDB implementation (in-memory, surrealkv or remote)

mod error;
pub mod fakes;
mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    AgentRun, CandidateRecord, CheckpointId, CheckpointRepository, CheckpointState,
    CheckpointStatus, ContentDigest, CriterionResult, DecisionMethod, DecisionRecord,
    EvaluationCategory, EvaluationResult, HistoryMessage, Phase, RunId, RunInput, RunRepository,
    RunStatus, StorageResult, TokenMetrics,
};
pub use surreal_store::SurrealStore;

/// Result type for connection-level operations
pub type Result<T> = std::result::Result<T, StateError>;
