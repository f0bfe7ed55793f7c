//! Candidate evaluators and their registry.
//!
//! Evaluators are either deterministic (reproducible checks such as running
//! a command or scanning for markers) or LLM-judged. Evaluation is
//! infallible: an evaluator that cannot do its job reports a failed
//! criterion instead of an error.

pub mod command;
pub mod llm;
pub mod marker;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::dispatch::panic_message;
use crate::domain::{
    CandidateRecord, ConclaveError, CriterionResult, EvaluationCategory, EvaluationResult, Phase,
    Result, RunId,
};

pub use command::CommandEvaluator;
pub use llm::LlmEvaluator;
pub use marker::MarkerEvaluator;

/// What an evaluator knows about the candidate it is checking.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub run_id: RunId,
    pub phase: Phase,
    /// The user's task message.
    pub task: String,
    pub candidate_id: String,
    pub agent_name: String,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    fn is_deterministic(&self) -> bool;

    fn category(&self) -> EvaluationCategory {
        if self.is_deterministic() {
            EvaluationCategory::Deterministic
        } else {
            EvaluationCategory::Llm
        }
    }

    async fn evaluate(&self, output: &str, context: &EvaluationContext) -> EvaluationResult;
}

struct Registration {
    evaluator: Arc<dyn Evaluator>,
    /// `None` means every phase.
    phases: Option<Vec<Phase>>,
}

impl Registration {
    fn applies_to(&self, phase: Phase) -> bool {
        self.phases.as_ref().map_or(true, |p| p.contains(&phase))
    }
}

/// Evaluators scoped globally or to specific phases, kept in registration order.
#[derive(Default)]
pub struct EvaluatorRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an evaluator for `phases`, or for every phase when `None`.
    /// Names must be unique.
    pub fn register(&self, evaluator: Arc<dyn Evaluator>, phases: Option<&[Phase]>) -> Result<()> {
        let name = evaluator.name().to_string();
        if name.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "evaluator name cannot be empty".to_string(),
            ));
        }
        if phases.is_some_and(|p| p.is_empty()) {
            return Err(ConclaveError::Validation(format!(
                "evaluator '{name}' scoped to an empty phase list"
            )));
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|r| r.evaluator.name() == name) {
            return Err(ConclaveError::Validation(format!(
                "evaluator '{name}' is already registered"
            )));
        }
        debug!(evaluator = %name, deterministic = evaluator.is_deterministic(), "evaluator registered");
        entries.push(Registration {
            evaluator,
            phases: phases.map(<[Phase]>::to_vec),
        });
        Ok(())
    }

    /// Global and phase-scoped evaluators for `phase`, in registration order.
    pub fn get_evaluators(&self, phase: Phase) -> Vec<Arc<dyn Evaluator>> {
        self.select(phase, |_| true)
    }

    pub fn get_deterministic_evaluators(&self, phase: Phase) -> Vec<Arc<dyn Evaluator>> {
        self.select(phase, |e| e.is_deterministic())
    }

    pub fn get_llm_evaluators(&self, phase: Phase) -> Vec<Arc<dyn Evaluator>> {
        self.select(phase, |e| !e.is_deterministic())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn select(&self, phase: Phase, keep: impl Fn(&dyn Evaluator) -> bool) -> Vec<Arc<dyn Evaluator>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.applies_to(phase) && keep(r.evaluator.as_ref()))
            .map(|r| Arc::clone(&r.evaluator))
            .collect()
    }

    /// Evaluate every candidate for `phase`, appending results to
    /// `candidate.evaluations`.
    ///
    /// Deterministic evaluators run first. LLM evaluators only see candidates
    /// that passed every deterministic check, unless `llm_on_deterministic_failure`.
    /// Candidates are evaluated concurrently; evaluators for one candidate
    /// run in registration order.
    pub async fn evaluate_candidates(
        &self,
        phase: Phase,
        task: &str,
        candidates: &mut [CandidateRecord],
        llm_on_deterministic_failure: bool,
    ) {
        let deterministic = self.get_deterministic_evaluators(phase);
        let llm = self.get_llm_evaluators(phase);
        if deterministic.is_empty() && llm.is_empty() {
            return;
        }

        let jobs = candidates.iter().map(|candidate| {
            let context = EvaluationContext {
                run_id: candidate.run_id.clone(),
                phase,
                task: task.to_string(),
                candidate_id: candidate.id.clone(),
                agent_name: candidate.agent_name.clone(),
            };
            let deterministic = &deterministic;
            let llm = &llm;
            async move {
                let mut results = Vec::with_capacity(deterministic.len() + llm.len());
                for evaluator in deterministic {
                    results.push(run_guarded(evaluator.as_ref(), &candidate.output, &context).await);
                }
                let passed = results.iter().all(|r| r.passed);
                if passed || llm_on_deterministic_failure {
                    for evaluator in llm {
                        results.push(run_guarded(evaluator.as_ref(), &candidate.output, &context).await);
                    }
                } else {
                    debug!(candidate = %candidate.id, "skipping llm evaluators after deterministic failure");
                }
                results
            }
        });
        let all_results = join_all(jobs).await;

        for (candidate, results) in candidates.iter_mut().zip(all_results) {
            candidate.evaluations.extend(results);
        }
    }
}

/// Run one evaluator, turning a panic into a failed `panic` criterion.
async fn run_guarded(
    evaluator: &dyn Evaluator,
    output: &str,
    context: &EvaluationContext,
) -> EvaluationResult {
    match AssertUnwindSafe(evaluator.evaluate(output, context))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(
                evaluator = evaluator.name(),
                candidate = %context.candidate_id,
                error = %message,
                "evaluator panicked"
            );
            EvaluationResult::from_criteria(
                evaluator.name(),
                evaluator.category(),
                vec![CriterionResult::fail("panic", format!("evaluator panicked: {message}"))],
            )
        }
    }
}
