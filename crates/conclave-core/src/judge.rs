//! Judge/decision pipeline.
//!
//! Given a phase's candidates, ask a judge agent to pick the best one and
//! turn its reply into a [`DecisionRecord`]. Judge output is untrusted: a
//! reply that cannot be parsed, or that names a candidate we never showed
//! it, is discarded and the deterministic tie-break picks the winner.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::adapter::truncate;
use crate::collector::{TelemetryCollector, TelemetryEvent};
use crate::dispatch::PromptDispatcher;
use crate::domain::{
    AgentConfig, CandidateRecord, ConclaveError, DecisionMethod, DecisionRecord, Phase, Result,
    RunId, TokenMetrics,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::AgentFilter;

/// `model_name` recorded for decisions that did not come from a judge.
pub const TIE_BREAK_MODEL: &str = "tie-break";
pub const SINGLE_CANDIDATE_MODEL: &str = "single-candidate";

const OUTPUT_LIMIT: usize = 8_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeConfig {
    /// Judge agent name. Falls back to `default_provider` when unset or unknown.
    pub agent: Option<String>,
    /// Provider whose first registered agent (by name) judges when `agent` is unset.
    pub default_provider: Option<String>,
    pub timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            agent: None,
            default_provider: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// A parsed, validated judge reply.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub candidate_id: String,
    pub score: f64,
    /// Judge rationale with any sub-scores folded in.
    pub rationale: String,
}

/// Everything the judge needs for one decision.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub run_id: &'a RunId,
    pub phase: Phase,
    pub attempt: u32,
    pub task: &'a str,
    /// In dispatch order.
    pub candidates: &'a [CandidateRecord],
    /// Absolute run deadline, if any; caps the judge call.
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub decision: DecisionRecord,
    /// Tokens spent on the judge call itself.
    pub usage: TokenMetrics,
}

pub struct Judge {
    dispatcher: Arc<PromptDispatcher>,
    config: JudgeConfig,
    telemetry: TelemetryCollector,
}

impl Judge {
    pub fn new(dispatcher: Arc<PromptDispatcher>, config: JudgeConfig) -> Self {
        Self {
            dispatcher,
            config,
            telemetry: TelemetryCollector::disabled(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// The agent that will judge, if any.
    pub fn resolve_agent(&self) -> Option<AgentConfig> {
        let registry = self.dispatcher.registry();
        if let Some(name) = &self.config.agent {
            match registry.get(name) {
                Ok(agent) => return Some(agent),
                Err(_) => warn!(agent = %name, "configured judge agent is not registered"),
            }
        }
        let provider = self.config.default_provider.as_deref()?;
        registry
            .list(Some(&AgentFilter::provider(provider)))
            .into_iter()
            .next()
    }

    /// Select a winner among `request.candidates`.
    ///
    /// Fails only when there are no candidates; every judge problem falls
    /// back to [`tie_break`].
    #[instrument(skip(self, request), fields(run_id = %request.run_id, phase = %request.phase))]
    pub async fn decide(&self, request: JudgeRequest<'_>) -> Result<JudgeOutcome> {
        let candidates = request.candidates;
        if candidates.is_empty() {
            return Err(ConclaveError::PhaseFatal {
                phase: request.phase,
                reason: "judge called with zero candidates".to_string(),
            });
        }

        if let [only] = candidates {
            debug!(candidate = %only.id, "single candidate; skipping judge");
            let decision = self.record(
                &request,
                &only.id,
                1.0,
                "only one candidate".to_string(),
                SINGLE_CANDIDATE_MODEL.to_string(),
                DecisionMethod::SingleCandidate,
            );
            return Ok(JudgeOutcome {
                decision,
                usage: TokenMetrics::default(),
            });
        }

        let Some(agent) = self.resolve_agent() else {
            return Ok(self.fall_back(&request, "no judge agent available", TokenMetrics::default()));
        };

        let mut timeout = self.config.timeout;
        if let Some(deadline) = request.deadline {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }
        if timeout.is_zero() {
            return Ok(self.fall_back(&request, "no time left for judge", TokenMetrics::default()));
        }

        let prompt = build_judge_prompt(request.task, candidates);
        let names = [agent.name.clone()];
        let responses = self.dispatcher.dispatch(&prompt, Some(&names[..]), timeout).await?;
        let Some(response) = responses.into_iter().next() else {
            return Ok(self.fall_back(&request, "judge returned no response", TokenMetrics::default()));
        };

        if let Some(error) = &response.error {
            self.telemetry.record(
                TelemetryEvent::new("judge.dispatch_failed")
                    .warn()
                    .with_trace(request.run_id.as_str())
                    .with_attr("phase", request.phase.as_str())
                    .with_attr("judge", agent.name.as_str())
                    .with_error(error.as_str()),
            );
            return Ok(self.fall_back(&request, &format!("judge call failed: {error}"), response.usage));
        }

        match parse_verdict(&response.output, candidates) {
            Ok(verdict) => {
                info!(candidate = %verdict.candidate_id, score = verdict.score, judge = %agent.name, "judge selected candidate");
                let decision = self.record(
                    &request,
                    &verdict.candidate_id,
                    verdict.score,
                    verdict.rationale,
                    agent.model_name.clone(),
                    DecisionMethod::Judge,
                );
                Ok(JudgeOutcome {
                    decision,
                    usage: response.usage,
                })
            }
            Err(err) => {
                warn!(error = %err, judge = %agent.name, "discarding judge output");
                self.telemetry.record(
                    TelemetryEvent::new("judge.parse_failed")
                        .warn()
                        .with_trace(request.run_id.as_str())
                        .with_attr("phase", request.phase.as_str())
                        .with_attr("judge", agent.name.as_str())
                        .with_attr("output", truncate(&response.output, 500))
                        .with_error(err.to_string()),
                );
                Ok(self.fall_back(&request, &err.to_string(), response.usage))
            }
        }
    }

    fn fall_back(&self, request: &JudgeRequest<'_>, reason: &str, usage: TokenMetrics) -> JudgeOutcome {
        METRICS.inc_judge_fallbacks();
        obs::emit_judge_fallback(request.run_id.as_str(), request.phase, reason);

        // Non-empty is checked by `decide`.
        let (winner, passed) = tie_break(request.candidates)
            .map(|c| (c.id.clone(), c.passed_deterministic()))
            .unwrap_or_default();
        let rule = if passed {
            "first candidate that passed deterministic checks"
        } else {
            "no candidate passed deterministic checks; first by dispatch order"
        };
        let decision = self.record(
            request,
            &winner,
            0.0,
            format!("tie-break ({reason}): {rule}"),
            TIE_BREAK_MODEL.to_string(),
            DecisionMethod::TieBreak,
        );
        JudgeOutcome { decision, usage }
    }

    fn record(
        &self,
        request: &JudgeRequest<'_>,
        candidate_id: &str,
        score: f64,
        rationale: String,
        model_name: String,
        method: DecisionMethod,
    ) -> DecisionRecord {
        DecisionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: request.run_id.clone(),
            phase: request.phase,
            attempt: request.attempt,
            candidate_id: candidate_id.to_string(),
            score,
            rationale,
            model_name,
            method,
            created_at: Utc::now(),
        }
    }
}

/// First candidate (dispatch order) whose deterministic evaluations all
/// passed, else the first candidate.
pub fn tie_break(candidates: &[CandidateRecord]) -> Option<&CandidateRecord> {
    let mut ordered: Vec<&CandidateRecord> = candidates.iter().collect();
    ordered.sort_by_key(|c| c.dispatch_index);
    ordered
        .iter()
        .find(|c| c.passed_deterministic())
        .or_else(|| ordered.first())
        .copied()
}

/// Build the judge prompt: task, criteria, candidates and reply schema.
pub fn build_judge_prompt(task: &str, candidates: &[CandidateRecord]) -> String {
    let mut prompt = format!(
        "You are judging {} candidate responses to the same task. Choose the single best one.\n\n\
         ## Task\n{}\n\n\
         ## Criteria\n\
         - helpfulness: does the response fully and usefully address the task?\n\
         - correctness: is the response accurate and free of defects?\n\n\
         ## Candidates\n",
        candidates.len(),
        task.trim()
    );

    for candidate in candidates {
        prompt.push_str(&format!(
            "\n### candidate_id: {}\nagent: {}\nevaluations: {}\noutput:\n```\n{}\n```\n",
            candidate.id,
            candidate.agent_name,
            evaluation_summary(candidate),
            truncate(&candidate.output, OUTPUT_LIMIT),
        ));
    }

    prompt.push_str(
        "\n## Reply format\n\
         Reply with exactly one JSON object and nothing else:\n\
         {\"candidate_id\": \"<id of the best candidate>\", \"score\": <0.0-1.0>, \
         \"helpfulness_score\": <0.0-1.0>, \"correctness_score\": <0.0-1.0>, \
         \"rationale\": \"<one or two sentences>\"}\n",
    );
    prompt
}

fn evaluation_summary(candidate: &CandidateRecord) -> String {
    if candidate.evaluations.is_empty() {
        return "none".to_string();
    }
    candidate
        .evaluations
        .iter()
        .map(|e| {
            if e.passed {
                format!("{}=passed", e.evaluator_name)
            } else {
                let failed: Vec<&str> = e.failed_criteria().map(|c| c.name.as_str()).collect();
                format!("{}=failed ({})", e.evaluator_name, failed.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse and validate a judge reply against the candidates it was shown.
pub fn parse_verdict(text: &str, candidates: &[CandidateRecord]) -> Result<JudgeVerdict> {
    let parse_err = |msg: String| ConclaveError::JudgeParse(msg);

    let json = extract_json(text).ok_or_else(|| parse_err("no JSON object in judge output".into()))?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| parse_err(format!("malformed JSON: {e}")))?;

    let candidate_id = value
        .get("candidate_id")
        .and_then(Value::as_str)
        .ok_or_else(|| parse_err("missing string field candidate_id".into()))?;
    if !candidates.iter().any(|c| c.id == candidate_id) {
        return Err(parse_err(format!("unknown candidate_id '{candidate_id}'")));
    }

    let score = value
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| parse_err("missing numeric field score".into()))?;
    if !(0.0..=1.0).contains(&score) {
        return Err(parse_err(format!("score {score} outside [0, 1]")));
    }

    let rationale = value
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();
    let sub_scores: Vec<String> = ["helpfulness", "correctness"]
        .iter()
        .filter_map(|name| {
            value
                .get(format!("{name}_score"))
                .and_then(Value::as_f64)
                .map(|s| format!("{name}={s}"))
        })
        .collect();

    let rationale = match (rationale.is_empty(), sub_scores.is_empty()) {
        (_, true) => rationale.to_string(),
        (true, false) => sub_scores.join(", "),
        (false, false) => format!("{rationale} ({})", sub_scores.join(", ")),
    };

    Ok(JudgeVerdict {
        candidate_id: candidate_id.to_string(),
        score,
        rationale,
    })
}

/// Find a JSON object in free text: a fenced code block first, else the
/// first balanced `{...}` (string-aware).
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        if let Some(end) = after.find("```") {
            let block = &after[..end];
            if let Some(object) = balanced_object(block) {
                return Some(object);
            }
        }
    }
    balanced_object(text)
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
