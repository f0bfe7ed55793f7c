//! Prompt templates for each phase.

use crate::adapter::truncate;
use crate::domain::{Phase, RunInput};

use super::context::PhaseContext;

const HISTORY_LIMIT: usize = 2_000;

/// Inputs shared by every phase prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub input: &'a RunInput,
    pub plan: &'a str,
    pub context: &'a PhaseContext,
    /// Rendered feedback from earlier rejected attempts, if any.
    pub feedback: Option<&'a str>,
    pub success_marker: &'a str,
    pub failure_marker: &'a str,
}

pub fn build_phase_prompt(phase: Phase, inputs: PromptInputs<'_>) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} phase\n\n", title(phase)));
    out.push_str(&format!("## Task\n{}\n\n", inputs.input.message.trim()));

    if !inputs.input.history.is_empty() {
        out.push_str("## Conversation so far\n");
        for message in &inputs.input.history {
            out.push_str(&format!(
                "- {}: {}\n",
                message.role,
                truncate(&message.content, HISTORY_LIMIT)
            ));
        }
        out.push('\n');
    }

    out.push_str(&format!("## Plan\n{}\n\n", inputs.plan.trim()));

    match phase {
        Phase::Planning => {
            out.push_str(
                "## Instructions\n\
                 Turn the plan into a concrete, numbered implementation plan for the task. \
                 Name the files to change and the tests that prove the work is done.\n",
            );
        }
        Phase::Coding => {
            if let Some(plan) = inputs.context.output(Phase::Planning) {
                out.push_str(&format!("## Implementation plan\n{}\n\n", plan.trim()));
            }
            out.push_str(
                "## Instructions\n\
                 Implement the implementation plan. Reply with the complete change.\n",
            );
        }
        Phase::Verification => {
            if let Some(plan) = inputs.context.output(Phase::Planning) {
                out.push_str(&format!("## Implementation plan\n{}\n\n", plan.trim()));
            }
            if let Some(code) = inputs.context.output(Phase::Coding) {
                out.push_str(&format!("## Implementation\n```\n{}\n```\n\n", code.trim()));
            }
            out.push_str(&format!(
                "## Instructions\n\
                 Check the implementation against the task and the plan. \
                 End your reply with exactly one line: `{}` if it is correct and complete, \
                 or `{}` followed by what must change.\n",
                inputs.success_marker, inputs.failure_marker
            ));
        }
    }

    if let Some(feedback) = inputs.feedback {
        out.push('\n');
        out.push_str(feedback);
    }
    out
}

fn title(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => "Planning",
        Phase::Coding => "Coding",
        Phase::Verification => "Verification",
    }
}
