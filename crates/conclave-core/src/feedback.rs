//! Bounded per-phase memory of failed attempts.
//!
//! On retry the runner folds the most recent failures into the next prompt
//! so the agents can see what went wrong. Each phase keeps at most
//! `max_attempts` records; the oldest is dropped first.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::truncate;
use crate::domain::{EvaluationResult, Phase};

const EXCERPT_LIMIT: usize = 600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub candidate_output: String,
    pub evaluation_results: Vec<EvaluationResult>,
    pub timestamp: DateTime<Utc>,
    /// Free-form failure note, e.g. the verifier's report.
    pub note: Option<String>,
}

impl AttemptRecord {
    pub fn new(candidate_output: impl Into<String>, evaluation_results: Vec<EvaluationResult>) -> Self {
        Self {
            candidate_output: candidate_output.into(),
            evaluation_results,
            timestamp: Utc::now(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackMemory {
    max_attempts: usize,
    attempts: HashMap<Phase, VecDeque<AttemptRecord>>,
}

impl FeedbackMemory {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn record(&mut self, phase: Phase, attempt: AttemptRecord) {
        if self.max_attempts == 0 {
            return;
        }
        let queue = self.attempts.entry(phase).or_default();
        queue.push_back(attempt);
        while queue.len() > self.max_attempts {
            queue.pop_front();
        }
    }

    /// Up to `n` most recent attempts for `phase`, newest first.
    pub fn recent(&self, phase: Phase, n: usize) -> Vec<&AttemptRecord> {
        self.attempts
            .get(&phase)
            .map(|q| q.iter().rev().take(n).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, phase: Phase) -> usize {
        self.attempts.get(&phase).map_or(0, VecDeque::len)
    }

    /// A prompt section describing the `n` most recent failures, or `None`
    /// when nothing is remembered for `phase`.
    pub fn render_feedback(&self, phase: Phase, n: usize) -> Option<String> {
        let recent = self.recent(phase, n);
        if recent.is_empty() {
            return None;
        }

        let mut out = String::from(
            "## Feedback from previous attempts\n\
             Earlier attempts at this phase were rejected. Fix these problems:\n",
        );
        for (i, attempt) in recent.iter().enumerate() {
            out.push_str(&format!(
                "\n### Attempt -{} ({})\n",
                i + 1,
                attempt.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            if let Some(note) = &attempt.note {
                out.push_str(&format!("- note: {}\n", truncate(note, EXCERPT_LIMIT)));
            }
            for evaluation in attempt.evaluation_results.iter().filter(|e| !e.passed) {
                for criterion in evaluation.failed_criteria() {
                    out.push_str(&format!(
                        "- [{}] {}: {}\n",
                        evaluation.evaluator_name,
                        criterion.name,
                        truncate(&criterion.detail, EXCERPT_LIMIT)
                    ));
                }
            }
            out.push_str(&format!(
                "- rejected output (excerpt):\n```\n{}\n```\n",
                truncate(&attempt.candidate_output, EXCERPT_LIMIT)
            ));
        }
        Some(out)
    }

    pub fn clear(&mut self, phase: Phase) {
        self.attempts.remove(&phase);
    }

    pub fn clear_all(&mut self) {
        self.attempts.clear();
    }
}
