//! Where a run's plan text comes from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::domain::{AgentRun, ConclaveError, Result, RunId};

/// Read-only lookup of the plan for a run.
///
/// Implementations return [`ConclaveError::NotFound`] when no plan exists.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn resolve_plan(&self, run: &AgentRun) -> Result<String>;
}

/// Plans held in memory, keyed by run id, with an optional default.
///
/// A fork without its own entry inherits its parent run's plan.
#[derive(Debug, Default)]
pub struct StaticPlanSource {
    default: Option<String>,
    plans: RwLock<HashMap<RunId, String>>,
}

impl StaticPlanSource {
    /// No plans at all; every lookup is `NotFound` until [`insert`](Self::insert).
    pub fn empty() -> Self {
        Self::default()
    }

    /// The same plan for every run.
    pub fn new(plan: impl Into<String>) -> Self {
        Self {
            default: Some(plan.into()),
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, run_id: RunId, plan: impl Into<String>) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, plan.into());
    }
}

#[async_trait]
impl PlanSource for StaticPlanSource {
    async fn resolve_plan(&self, run: &AgentRun) -> Result<String> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        std::iter::once(&run.id)
            .chain(run.parent_run_id.as_ref())
            .find_map(|id| plans.get(id).cloned())
            .or_else(|| self.default.clone())
            .ok_or_else(|| ConclaveError::not_found("plan", run.id.as_str()))
    }
}

/// Plans on disk.
///
/// If `path` is a file, it is the plan for every run. If it is a directory,
/// the plan for a run is `<dir>/<run_id>.md`, then `<dir>/<parent_run_id>.md`
/// for forks, then `<dir>/default.md`. Blank files count as missing.
#[derive(Debug, Clone)]
pub struct FilePlanSource {
    path: PathBuf,
}

impl FilePlanSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn candidates(&self, run: &AgentRun) -> Vec<PathBuf> {
        let mut names = vec![format!("{}.md", run.id)];
        if let Some(parent) = &run.parent_run_id {
            names.push(format!("{parent}.md"));
        }
        names.push("default.md".to_string());
        names.into_iter().map(|n| self.path.join(n)).collect()
    }
}

#[async_trait]
impl PlanSource for FilePlanSource {
    async fn resolve_plan(&self, run: &AgentRun) -> Result<String> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConclaveError::not_found(
                    "plan",
                    self.path.display().to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let paths = if metadata.is_dir() {
            self.candidates(run)
        } else {
            vec![self.path.clone()]
        };

        for path in &paths {
            match tokio::fs::read_to_string(path).await {
                Ok(text) if !text.trim().is_empty() => return Ok(text),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ConclaveError::not_found(
            "plan",
            format!("{} (run {})", self.path.display(), run.id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunInput;

    fn run() -> AgentRun {
        AgentRun::new(RunInput::new("task"))
    }

    #[tokio::test]
    async fn test_static_source_default_and_overrides() {
        let source = StaticPlanSource::new("default plan");
        let a = run();
        let b = run();
        source.insert(b.id.clone(), "plan for b");
        assert_eq!(source.resolve_plan(&a).await.unwrap(), "default plan");
        assert_eq!(source.resolve_plan(&b).await.unwrap(), "plan for b");
    }

    #[tokio::test]
    async fn test_static_source_fork_inherits_parent_plan() {
        let source = StaticPlanSource::empty();
        let parent = run();
        source.insert(parent.id.clone(), "parent plan");

        let mut child = run();
        child.parent_run_id = Some(parent.id.clone());
        assert_eq!(source.resolve_plan(&child).await.unwrap(), "parent plan");
        assert!(source.resolve_plan(&run()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_file_source_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.md");
        std::fs::write(&path, "1. parse\n2. test\n").unwrap();
        let source = FilePlanSource::new(&path);
        assert!(source.resolve_plan(&run()).await.unwrap().contains("parse"));
    }

    #[tokio::test]
    async fn test_file_source_directory_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let specific = run();
        std::fs::write(dir.path().join(format!("{}.md", specific.id)), "specific").unwrap();
        std::fs::write(dir.path().join("default.md"), "fallback").unwrap();

        let source = FilePlanSource::new(dir.path());
        assert_eq!(source.resolve_plan(&specific).await.unwrap(), "specific");
        assert_eq!(source.resolve_plan(&run()).await.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_file_source_missing_or_blank_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FilePlanSource::new(dir.path().join("nope.md"));
        assert!(missing.resolve_plan(&run()).await.unwrap_err().is_not_found());

        let blank = dir.path().join("blank.md");
        std::fs::write(&blank, "  \n").unwrap();
        let source = FilePlanSource::new(&blank);
        assert!(source.resolve_plan(&run()).await.unwrap_err().is_not_found());
    }
}
