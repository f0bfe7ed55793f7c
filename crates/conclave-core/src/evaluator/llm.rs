//! LLM-judged evaluator.
//!
//! Asks one agent for a pass/fail verdict per criterion. The reply must be a
//! JSON object of the form
//! `{"criteria": [{"name": "...", "passed": true, "detail": "..."}]}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{EvaluationContext, Evaluator};
use crate::adapter::truncate;
use crate::dispatch::PromptDispatcher;
use crate::domain::{CriterionResult, EvaluationCategory, EvaluationResult};
use crate::judge::extract_json;

const OUTPUT_LIMIT: usize = 8_000;

#[derive(Debug, Deserialize)]
struct Verdicts {
    criteria: Vec<Verdict>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    name: String,
    passed: bool,
    #[serde(default)]
    detail: String,
}

pub struct LlmEvaluator {
    name: String,
    agent: String,
    criteria: Vec<String>,
    dispatcher: Arc<PromptDispatcher>,
    timeout: Duration,
}

impl LlmEvaluator {
    pub fn new(
        name: impl Into<String>,
        agent: impl Into<String>,
        criteria: Vec<String>,
        dispatcher: Arc<PromptDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            criteria,
            dispatcher,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build_prompt(&self, output: &str, context: &EvaluationContext) -> String {
        let criteria: String = self
            .criteria
            .iter()
            .map(|c| format!("- {c}\n"))
            .collect();
        format!(
            "Evaluate a candidate response produced during the {phase} phase.\n\n\
             ## Task\n{task}\n\n\
             ## Candidate response\n```\n{output}\n```\n\n\
             ## Criteria\n{criteria}\n\
             Judge each criterion independently. Reply with exactly one JSON object:\n\
             {{\"criteria\": [{{\"name\": \"<criterion>\", \"passed\": true|false, \"detail\": \"<short reason>\"}}]}}\n",
            phase = context.phase,
            task = context.task.trim(),
            output = truncate(output, OUTPUT_LIMIT),
        )
    }

    /// Map a raw reply onto the configured criteria.
    pub fn interpret(&self, reply: &str) -> Vec<CriterionResult> {
        let parsed = extract_json(reply)
            .ok_or_else(|| "no JSON object in reply".to_string())
            .and_then(|json| {
                serde_json::from_str::<Verdicts>(json).map_err(|e| format!("malformed reply: {e}"))
            });
        let verdicts = match parsed {
            Ok(v) => v.criteria,
            Err(reason) => return vec![CriterionResult::fail("verdict", reason)],
        };

        self.criteria
            .iter()
            .map(|criterion| {
                match verdicts
                    .iter()
                    .find(|v| v.name.trim().eq_ignore_ascii_case(criterion))
                {
                    Some(v) if v.passed => CriterionResult::pass(criterion.clone(), v.detail.clone()),
                    Some(v) => CriterionResult::fail(criterion.clone(), v.detail.clone()),
                    None => CriterionResult::fail(criterion.clone(), "no verdict returned"),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    async fn evaluate(&self, output: &str, context: &EvaluationContext) -> EvaluationResult {
        let prompt = self.build_prompt(output, context);
        let agents = [self.agent.clone()];

        let criteria = match self
            .dispatcher
            .dispatch(&prompt, Some(&agents[..]), self.timeout)
            .await
        {
            Ok(responses) => match responses.into_iter().next() {
                Some(r) if r.is_success() => self.interpret(&r.output),
                Some(r) => {
                    let error = r.error.unwrap_or_default();
                    warn!(evaluator = %self.name, error = %error, "llm evaluator call failed");
                    vec![CriterionResult::fail("verdict", format!("evaluator agent failed: {error}"))]
                }
                None => vec![CriterionResult::fail("verdict", "evaluator agent returned nothing")],
            },
            Err(e) => vec![CriterionResult::fail("verdict", e.to_string())],
        };

        EvaluationResult::from_criteria(self.name.clone(), EvaluationCategory::Llm, criteria)
    }
}
