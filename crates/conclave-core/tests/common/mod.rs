//! Shared harness for the integration suites: three scripted workers and a
//! scripted judge, all behind one SDK adapter.

#![allow(dead_code)]

use std::sync::Arc;

use conclave_core::fakes::ScriptedAdapter;
use conclave_core::{
    AdapterSet, AgentConfig, IntegrationType, JudgeConfig, Orchestrator, OrchestratorBuilder,
    Phase, RunnerPolicy, StaticPlanSource, TokenMetrics,
};

pub const WORKERS: [&str; 3] = ["alpha", "beta", "gamma"];
pub const JUDGE: &str = "judge";

pub fn agents() -> Vec<AgentConfig> {
    let mut agents: Vec<AgentConfig> = WORKERS
        .iter()
        .map(|name| AgentConfig::sdk(name, "scripted", &format!("{name}-model")))
        .collect();
    agents.push(AgentConfig::sdk(JUDGE, "scripted", "judge-model"));
    agents
}

/// Every phase dispatches to the workers only.
pub fn policy() -> RunnerPolicy {
    Phase::ALL
        .iter()
        .fold(RunnerPolicy::default(), |policy, phase| {
            policy.with_phase_agents(*phase, WORKERS)
        })
}

pub fn judge_config() -> JudgeConfig {
    JudgeConfig {
        agent: Some(JUDGE.to_string()),
        ..JudgeConfig::default()
    }
}

pub fn adapter() -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(IntegrationType::Sdk).with_usage(TokenMetrics::new(10, 5, 100)))
}

/// Candidate ids in the order the judge prompt lists them.
pub fn candidate_ids(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.strip_prefix("### candidate_id: "))
        .map(|id| id.trim().to_string())
        .collect()
}

/// A judge that always picks the candidate produced by `agent`, else the first.
pub fn judge_prefers(adapter: &ScriptedAdapter, agent: &'static str) {
    adapter.respond_with(JUDGE, move |prompt| {
        let ids = candidate_ids(prompt);
        let blocks: Vec<&str> = prompt.split("### candidate_id: ").skip(1).collect();
        let chosen = blocks
            .iter()
            .zip(&ids)
            .find(|(block, _)| block.contains(&format!("agent: {agent}\n")))
            .map(|(_, id)| id.clone())
            .or_else(|| ids.first().cloned())
            .unwrap_or_default();
        serde_json::json!({
            "candidate_id": chosen,
            "score": 0.9,
            "helpfulness_score": 0.8,
            "correctness_score": 1.0,
            "rationale": "most complete",
        })
        .to_string()
    });
}

/// Workers answer per phase; verification replies with `verdict`.
pub fn workers_reply(adapter: &ScriptedAdapter, verdict: &'static str) {
    for name in WORKERS {
        adapter.respond_with(name, move |prompt| {
            if prompt.starts_with("# Planning phase") {
                format!("{name}: 1. write the lexer 2. test it")
            } else if prompt.starts_with("# Coding phase") {
                format!("{name}: fn lex() {{}}")
            } else {
                format!("{name} reviewed the change.\n{verdict}")
            }
        });
    }
}

pub fn builder(adapter: Arc<ScriptedAdapter>) -> OrchestratorBuilder {
    Orchestrator::builder()
        .agents(agents())
        .adapters(AdapterSet::new().with(adapter))
        .plans(Arc::new(StaticPlanSource::new("Build a lexer in small steps.")))
        .policy(policy())
        .judge(judge_config())
}
