//! Deterministic evaluator that runs an external command against the output.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{EvaluationContext, Evaluator};
use crate::adapter::truncate;
use crate::domain::{CriterionResult, EvaluationCategory, EvaluationResult};

const FILE_PLACEHOLDER: &str = "{file}";
const DETAIL_LIMIT: usize = 400;

/// Writes the candidate output to a temp file and runs `program args...`.
///
/// The file path replaces any `{file}` placeholder in `args`, or is appended
/// as the last argument. Exit status 0 passes.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    suffix: String,
}

impl CommandEvaluator {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
            suffix: ".txt".to_string(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// File extension for the temp file, e.g. `.rs`.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    fn result(&self, criterion: CriterionResult) -> EvaluationResult {
        EvaluationResult::from_criteria(
            self.name.clone(),
            EvaluationCategory::Deterministic,
            vec![criterion],
        )
    }

    async fn run(&self, output: &str) -> CriterionResult {
        let criterion = "exit_status";

        let mut file = match tempfile::Builder::new()
            .prefix("conclave-candidate-")
            .suffix(&self.suffix)
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => return CriterionResult::fail(criterion, format!("temp file: {e}")),
        };
        if let Err(e) = file.write_all(output.as_bytes()).and_then(|_| file.flush()) {
            return CriterionResult::fail(criterion, format!("temp file: {e}"));
        }
        let path = file.path().display().to_string();

        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(FILE_PLACEHOLDER, &path))
            .collect();
        if !self.args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
            args.push(path.clone());
        }

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return CriterionResult::fail(
                    criterion,
                    format!("failed to spawn `{}`: {e}", self.program),
                )
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return CriterionResult::fail(criterion, format!("wait failed: {e}")),
            Err(_) => {
                return CriterionResult::fail(
                    criterion,
                    format!("timed out after {} ms", self.timeout.as_millis()),
                )
            }
        };

        let code = output.status.code().unwrap_or(-1);
        debug!(evaluator = %self.name, code, "command evaluator finished");
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            CriterionResult::pass(criterion, truncate(&format!("exit 0 {stdout}"), DETAIL_LIMIT))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            CriterionResult::fail(
                criterion,
                truncate(&format!("exit {code}: {detail}"), DETAIL_LIMIT),
            )
        }
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, output: &str, _context: &EvaluationContext) -> EvaluationResult {
        self.result(self.run(output).await)
    }
}
