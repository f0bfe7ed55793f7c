//! Conclave - multi-agent orchestration CLI
//!
//! The `conclave` command runs a task through several agents at once and
//! lets a judge pick the best answer for each phase.
//!
//! ## Commands
//!
//! - `run`: execute one task end to end and report the outcome
//! - `agents`: list the agents a config registers
//! - `validate`: check a config file without running anything
//! - `status`: show a stored run (persistent storage only)
//! - `checkpoints`: list a run's checkpoints (persistent storage only)
//! - `fork`: branch a new run off a checkpoint and execute it

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use conclave_core::config::{EngineConfig, StorageBackend};
use conclave_core::{
    AdapterSet, AgentRun, CheckpointId, FilePlanSource, Orchestrator, RunId, RunInput, RunStatus,
};
use conclave_state::{DecisionRecord, HistoryMessage};

#[derive(Parser)]
#[command(name = "conclave")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-agent orchestration: fan out, judge, checkpoint", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Engine config file (TOML)
    #[arg(short, long, global = true, env = "CONCLAVE_CONFIG", default_value = "conclave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task through planning, coding and verification
    Run {
        /// Task for the agents
        #[arg(short, long)]
        message: String,

        /// Plan file, or a directory of `<run_id>.md` / `default.md` plans
        #[arg(short, long)]
        plan: PathBuf,

        /// Prior conversation as a JSON array of {role, content}
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// List configured agents
    Agents,

    /// Validate the config file
    Validate,

    /// Show a stored run and its decisions
    Status {
        /// Run ID
        run: String,
    },

    /// List the checkpoints of a stored run
    Checkpoints {
        /// Run ID
        run: String,
    },

    /// Fork a new run from a checkpoint and execute it
    Fork {
        /// Checkpoint ID to branch from
        checkpoint: String,

        /// Plan file or directory for the fork
        #[arg(short, long)]
        plan: PathBuf,

        /// Short label for the fork
        #[arg(short, long, default_value = "fork")]
        label: String,

        /// Why the fork was made
        #[arg(short, long, default_value = "manual fork")]
        reason: String,
    },
}

#[derive(Serialize)]
struct RunReport {
    run: AgentRun,
    decisions: Vec<DecisionRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    conclave_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Agents => cmd_agents(&cli.config, cli.json),
        Commands::Run {
            message,
            plan,
            history,
        } => cmd_run(&cli.config, &plan, &message, history.as_deref(), cli.json).await,
        Commands::Status { run } => cmd_status(&cli.config, &run, cli.json).await,
        Commands::Checkpoints { run } => cmd_checkpoints(&cli.config, &run, cli.json).await,
        Commands::Fork {
            checkpoint,
            plan,
            label,
            reason,
        } => cmd_fork(&cli.config, &plan, &checkpoint, &label, &reason, cli.json).await,
    }
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    EngineConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

async fn open(config: &EngineConfig, plan: &Path) -> Result<Orchestrator> {
    Orchestrator::from_config(
        config,
        AdapterSet::standard(),
        Arc::new(FilePlanSource::new(plan)),
    )
    .await
    .context("Failed to start orchestrator")
}

/// Lookups of stored runs only make sense when storage outlives the process.
fn require_persistent(config: &EngineConfig) -> Result<()> {
    if config.storage.backend == StorageBackend::Memory {
        bail!("this command needs persistent storage; set [storage] backend = \"surreal\"");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    println!(
        "{} is valid: {} agent(s), max_retries {}, max_checkpoints {}",
        config_path.display(),
        config.agents.len(),
        config.retry.max_retries,
        config.max_checkpoints
    );
    Ok(())
}

fn cmd_agents(config_path: &Path, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    if json {
        return print_json(&config.agents);
    }
    if config.agents.is_empty() {
        println!("No agents configured.");
        return Ok(());
    }
    println!("{:<20} {:<6} {:<16} MODEL", "NAME", "TYPE", "PROVIDER");
    for agent in &config.agents {
        println!(
            "{:<20} {:<6} {:<16} {}",
            agent.name,
            agent.integration_type.as_str(),
            agent.provider,
            agent.model_name
        );
    }
    Ok(())
}

async fn cmd_run(
    config_path: &Path,
    plan: &Path,
    message: &str,
    history: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let orchestrator = open(&config, plan).await?;

    let mut input = RunInput::new(message);
    if let Some(path) = history {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read history {}", path.display()))?;
        let history: Vec<HistoryMessage> =
            serde_json::from_str(&text).context("History must be a JSON array of {role, content}")?;
        input = input.with_history(history);
    }

    let run = orchestrator.create_run(input).await?;
    info!(run_id = %run.id, "starting run");
    let result = orchestrator.run_to_completion(&run.id).await;
    let outcome = report(&orchestrator, &run.id, json).await;
    orchestrator.shutdown().await;

    let finished = result?;
    outcome?;
    if finished.status != RunStatus::Completed {
        bail!(
            "run {} failed: {}",
            finished.id,
            finished.failure_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

async fn cmd_status(config_path: &Path, run: &str, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    require_persistent(&config)?;
    let orchestrator = open(&config, Path::new(".")).await?;
    let outcome = report(&orchestrator, &RunId::from(run), json).await;
    orchestrator.shutdown().await;
    outcome
}

async fn cmd_checkpoints(config_path: &Path, run: &str, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    require_persistent(&config)?;
    let orchestrator = open(&config, Path::new(".")).await?;
    let checkpoints = orchestrator.list_checkpoints(&RunId::from(run)).await;
    orchestrator.shutdown().await;
    let checkpoints = checkpoints?;

    if json {
        return print_json(&checkpoints);
    }
    if checkpoints.is_empty() {
        println!("No checkpoints for run {run}");
        return Ok(());
    }
    for cp in &checkpoints {
        println!(
            "#{:<3} {:<13} {:<10} tokens={:<8} {}",
            cp.seq,
            cp.phase.as_str(),
            cp.status.to_string(),
            cp.token_metrics.total_tokens,
            cp.id
        );
        if let Some(reason) = &cp.failure_reason {
            println!("      reason: {reason}");
        }
    }
    Ok(())
}

async fn cmd_fork(
    config_path: &Path,
    plan: &Path,
    checkpoint: &str,
    label: &str,
    reason: &str,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    require_persistent(&config)?;
    let orchestrator = open(&config, plan).await?;

    let fork = orchestrator
        .fork_run(&CheckpointId::from(checkpoint), label, reason)
        .await
        .with_context(|| format!("Failed to fork checkpoint {checkpoint}"))?;
    println!(
        "Forked run {} from {}",
        fork.id,
        fork.parent_run_id.as_ref().map_or("?", |id| id.as_str())
    );

    let result = orchestrator.run_to_completion(&fork.id).await;
    let outcome = report(&orchestrator, &fork.id, json).await;
    orchestrator.shutdown().await;
    result?;
    outcome
}

async fn report(orchestrator: &Orchestrator, run_id: &RunId, json: bool) -> Result<()> {
    let run = orchestrator.get_run(run_id).await?;
    let decisions = orchestrator.list_decisions(run_id).await?;
    if json {
        return print_json(&RunReport { run, decisions });
    }

    println!("run       {}", run.id);
    if let Some(parent) = &run.parent_run_id {
        println!("forked    from {parent} ({})", run.fork_label.as_deref().unwrap_or("-"));
    }
    println!("status    {}", run.status);
    if let Some(reason) = &run.failure_reason {
        println!("reason    {reason}");
    }
    println!(
        "tokens    {} (prompt {}, completion {}), cost ${:.4}",
        run.token_metrics.total_tokens,
        run.token_metrics.prompt_tokens,
        run.token_metrics.completion_tokens,
        run.token_metrics.cost()
    );
    if let Some(ms) = run.duration_ms {
        println!("duration  {ms} ms");
    }
    for decision in &decisions {
        println!();
        println!(
            "[{} #{}] {:?} score={:.2} model={}",
            decision.phase, decision.attempt, decision.method, decision.score, decision.model_name
        );
        println!("    {}", decision.rationale);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conclave",
            "--config",
            "c.toml",
            "run",
            "--message",
            "write a lexer",
            "--plan",
            "plans/",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("c.toml"));
        match cli.command {
            Commands::Run { message, plan, history } => {
                assert_eq!(message, "write a lexer");
                assert_eq!(plan, PathBuf::from("plans/"));
                assert!(history.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_fork_defaults() {
        let cli = Cli::try_parse_from(["conclave", "fork", "cp-1", "--plan", "p.md"]).unwrap();
        match cli.command {
            Commands::Fork { checkpoint, label, reason, .. } => {
                assert_eq!(checkpoint, "cp-1");
                assert_eq!(label, "fork");
                assert_eq!(reason, "manual fork");
            }
            _ => panic!("expected fork"),
        }
    }

    #[test]
    fn test_memory_storage_rejected_for_lookups() {
        let config = EngineConfig::default();
        assert!(require_persistent(&config).is_err());
    }
}
