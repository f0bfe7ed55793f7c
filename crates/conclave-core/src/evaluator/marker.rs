//! Deterministic substring checks.

use async_trait::async_trait;

use super::{EvaluationContext, Evaluator};
use crate::domain::{CriterionResult, EvaluationCategory, EvaluationResult};

/// Requires non-empty output, every `required` marker, and none of the
/// `forbidden` ones. Matching is case-sensitive.
#[derive(Debug, Clone)]
pub struct MarkerEvaluator {
    name: String,
    required: Vec<String>,
    forbidden: Vec<String>,
}

impl MarkerEvaluator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            forbidden: Vec::new(),
        }
    }

    pub fn require(mut self, marker: impl Into<String>) -> Self {
        self.required.push(marker.into());
        self
    }

    pub fn forbid(mut self, marker: impl Into<String>) -> Self {
        self.forbidden.push(marker.into());
        self
    }

    pub fn check(&self, output: &str) -> Vec<CriterionResult> {
        let mut criteria = Vec::with_capacity(1 + self.required.len() + self.forbidden.len());

        criteria.push(if output.trim().is_empty() {
            CriterionResult::fail("non_empty", "output is empty")
        } else {
            CriterionResult::pass("non_empty", format!("{} bytes", output.len()))
        });

        for marker in &self.required {
            let name = format!("contains:{marker}");
            criteria.push(if output.contains(marker.as_str()) {
                CriterionResult::pass(name, "present")
            } else {
                CriterionResult::fail(name, format!("required marker '{marker}' not found"))
            });
        }

        for marker in &self.forbidden {
            let name = format!("excludes:{marker}");
            criteria.push(match output.find(marker.as_str()) {
                None => CriterionResult::pass(name, "absent"),
                Some(pos) => CriterionResult::fail(
                    name,
                    format!("forbidden marker '{marker}' found at byte {pos}"),
                ),
            });
        }
        criteria
    }
}

#[async_trait]
impl Evaluator for MarkerEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    async fn evaluate(&self, output: &str, _context: &EvaluationContext) -> EvaluationResult {
        EvaluationResult::from_criteria(
            self.name.clone(),
            EvaluationCategory::Deterministic,
            self.check(output),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_and_forbidden() {
        let evaluator = MarkerEvaluator::new("markers").require("fn ").forbid("todo!()");

        let ok = evaluator.check("fn parse() {}");
        assert!(ok.iter().all(|c| c.passed));

        let bad = evaluator.check("fn parse() { todo!() }");
        let failed: Vec<_> = bad.iter().filter(|c| !c.passed).map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["excludes:todo!()"]);
    }

    #[test]
    fn test_empty_output_fails() {
        let criteria = MarkerEvaluator::new("m").check("   ");
        assert_eq!(criteria.len(), 1);
        assert!(!criteria[0].passed);
    }
}
