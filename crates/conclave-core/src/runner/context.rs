//! Phase context carried between phases and stored on checkpoints.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{CandidateRecord, Phase};

/// The winning candidate of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSelection {
    pub phase: Phase,
    pub attempt: u32,
    pub candidate_id: String,
    pub agent_name: String,
    pub output: String,
}

/// Selections so far plus retry bookkeeping.
///
/// Serialized into `CheckpointState::context`, so a restored or forked run
/// resumes with the same inputs the original had at that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseContext {
    #[serde(default)]
    pub selections: Vec<PhaseSelection>,
    #[serde(default)]
    pub verification_failures: u32,
}

impl PhaseContext {
    /// Parse a checkpoint context. Null or unrecognized JSON yields an empty context.
    pub fn from_value(value: &serde_json::Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value.clone()).unwrap_or_else(|err| {
            warn!(error = %err, "ignoring unreadable checkpoint context");
            Self::default()
        })
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Record `candidate` as the winner of `phase`, replacing any earlier one.
    pub fn select(&mut self, phase: Phase, attempt: u32, candidate: &CandidateRecord) {
        let selection = PhaseSelection {
            phase,
            attempt,
            candidate_id: candidate.id.clone(),
            agent_name: candidate.agent_name.clone(),
            output: candidate.output.clone(),
        };
        match self.selections.iter_mut().find(|s| s.phase == phase) {
            Some(existing) => *existing = selection,
            None => self.selections.push(selection),
        }
    }

    pub fn selection(&self, phase: Phase) -> Option<&PhaseSelection> {
        self.selections.iter().find(|s| s.phase == phase)
    }

    pub fn output(&self, phase: Phase) -> Option<&str> {
        self.selection(phase).map(|s| s.output.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContentDigest, RunId, TokenMetrics};
    use chrono::Utc;

    fn candidate(id: &str, output: &str) -> CandidateRecord {
        CandidateRecord {
            id: id.to_string(),
            run_id: RunId::from("r"),
            phase: Phase::Coding,
            attempt: 1,
            dispatch_index: 0,
            agent_name: "a".to_string(),
            provider: "p".to_string(),
            model_name: "m".to_string(),
            output: output.to_string(),
            output_digest: ContentDigest::from_bytes(output.as_bytes()),
            usage: TokenMetrics::default(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 0,
            evaluations: Vec::new(),
        }
    }

    #[test]
    fn test_select_replaces_same_phase() {
        let mut ctx = PhaseContext::default();
        ctx.select(Phase::Planning, 1, &candidate("p1", "plan"));
        ctx.select(Phase::Coding, 1, &candidate("c1", "v1"));
        ctx.select(Phase::Coding, 2, &candidate("c2", "v2"));
        assert_eq!(ctx.selections.len(), 2);
        assert_eq!(ctx.output(Phase::Coding), Some("v2"));
        assert_eq!(ctx.selection(Phase::Coding).unwrap().attempt, 2);
        assert!(ctx.output(Phase::Verification).is_none());
    }

    #[test]
    fn test_value_round_trip_and_garbage() {
        let mut ctx = PhaseContext::default();
        ctx.select(Phase::Planning, 1, &candidate("p1", "plan"));
        ctx.verification_failures = 1;
        assert_eq!(PhaseContext::from_value(&ctx.to_value()), ctx);

        assert_eq!(
            PhaseContext::from_value(&serde_json::json!("not a context")),
            PhaseContext::default()
        );
        assert_eq!(PhaseContext::from_value(&serde_json::Value::Null), PhaseContext::default());
    }
}
