// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman main entry point - operational CLI over the orchestration core.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use foreman::config::{self, CliOptions, ConflictPolicy, OrchestratorConfig, ReclaimPolicy};
use foreman::coordinator::{AssignmentCoordinator, EventSink};
use foreman::graph::{conflict, DependencyGraph};
use foreman::monitor::{ProgressMonitor, ScanReport};
use foreman::scheduler::PriorityScheduler;
use foreman::store::{parse_units, IssueStore, JsonlIssueStore};
use foreman::telemetry::{init_telemetry, TelemetryConfig};
use foreman::types::{UnitOfWork, UnitStatus};
use foreman::workspace::{GitWorktreeBackend, WorkspaceManager};
use foreman::GraphError;

/// Foreman version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Foreman - multi-agent work orchestration.
#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Multi-agent work orchestration", long_about = None)]
struct Cli {
    /// Repository root (defaults to the current directory)
    #[arg(long, global = true, env = "FOREMAN_REPO")]
    repo: Option<PathBuf>,

    /// Base branch for new workspaces
    #[arg(long, global = true)]
    base_branch: Option<String>,

    /// Stale work policy
    #[arg(long, global = true, value_enum)]
    reclaim: Option<ReclaimArg>,

    /// Conflict risk policy
    #[arg(long, global = true, value_enum)]
    conflicts: Option<ConflictArg>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Show info-level logs
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReclaimArg {
    AutoReclaim,
    AlertOnly,
}

impl From<ReclaimArg> for ReclaimPolicy {
    fn from(arg: ReclaimArg) -> Self {
        match arg {
            ReclaimArg::AutoReclaim => ReclaimPolicy::AutoReclaim,
            ReclaimArg::AlertOnly => ReclaimPolicy::AlertOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConflictArg {
    Ignore,
    Warn,
    Defer,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Ignore => ConflictPolicy::Ignore,
            ConflictArg::Warn => ConflictPolicy::Warn,
            ConflictArg::Defer => ConflictPolicy::Defer,
        }
    }
}

/// Subcommands for foreman.
#[derive(Subcommand)]
enum Commands {
    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Validate a batch of units and print the ranked ready queue
    Plan {
        /// JSON Lines file, one unit per line
        units: PathBuf,
    },

    /// List isolated workspaces in the repository
    Workspaces,

    /// Run one monitor pass against a JSON Lines issue store
    Reconcile {
        /// JSON Lines issue store
        #[arg(long, default_value = ".foreman/units.jsonl")]
        store: PathBuf,
    },

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show resolved configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(&TelemetryConfig::from_flags(cli.verbose, cli.debug))?;

    let workspace_root = match &cli.repo {
        Some(repo) => repo.clone(),
        None => std::env::current_dir()?,
    };
    let cli_options = CliOptions {
        repo_root: cli.repo.clone(),
        base_branch: cli.base_branch.clone(),
        max_active_workspaces: None,
        reclaim_policy: cli.reclaim.map(Into::into),
        conflict_policy: cli.conflicts.map(Into::into),
    };

    match cli.command {
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let config = config::load_config(&workspace_root, cli_options)?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    print!("{}", serde_yaml::to_string(&config)?);
                }
            }
        },
        Commands::Init => {
            let path = config::init_config(&workspace_root)?;
            println!("Created config file: {}", path.display());
        }
        Commands::Plan { units } => {
            let config = config::load_config(&workspace_root, cli_options)?;
            handle_plan(&config, &units, cli.json).await?;
        }
        Commands::Workspaces => {
            let config = config::load_config(&workspace_root, cli_options)?;
            handle_workspaces(&config, cli.json).await?;
        }
        Commands::Reconcile { store } => {
            let config = config::load_config(&workspace_root, cli_options)?;
            let store = if store.is_relative() {
                workspace_root.join(store)
            } else {
                store
            };
            handle_reconcile(config, &store, cli.json).await?;
        }
        Commands::Version => {
            println!("foreman {}", VERSION);
        }
    }
    Ok(())
}

async fn handle_plan(config: &OrchestratorConfig, path: &Path, json: bool) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let units = parse_units(&content)?;

    let graph = match DependencyGraph::from_units(&units) {
        Ok(graph) => graph,
        Err(e @ GraphError::CycleDetected { .. }) => {
            eprintln!("{} {}", "Rejected:".red().bold(), e);
            eprintln!("{}", "Break the cycle in the planner output and retry.".dimmed());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let now = Utc::now();
    let evaluated: Vec<UnitOfWork> = units
        .into_iter()
        .map(|mut unit| {
            if unit.status.awaits_readiness() {
                unit.status = if graph.is_ready(&unit.id) {
                    UnitStatus::Ready
                } else {
                    UnitStatus::Blocked
                };
            }
            unit
        })
        .collect();

    let scheduler = PriorityScheduler::new(config.scheduler.weights.clone());
    let ranked = scheduler.rank(&evaluated, &graph, now);
    let risks = conflict::detect(&evaluated);

    if json {
        let blocked: Vec<_> = evaluated
            .iter()
            .filter(|u| u.status == UnitStatus::Blocked)
            .map(|u| serde_json::json!({ "unitId": u.id, "openBlockers": graph.open_blockers(&u.id) }))
            .collect();
        let out = serde_json::json!({
            "ready": ranked,
            "blocked": blocked,
            "conflictRisks": risks,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", format!("Ready queue ({} units)", ranked.len()).bright_blue().bold());
    for (rank, scored) in ranked.iter().enumerate() {
        println!(
            "{:>3}. {} [{}] score {:.2}",
            rank + 1,
            scored.unit_id.as_str().bright_white(),
            scored.priority,
            scored.score
        );
    }
    for unit in evaluated.iter().filter(|u| u.status == UnitStatus::Blocked) {
        let blockers: Vec<String> = graph
            .open_blockers(&unit.id)
            .iter()
            .map(|b| b.to_string())
            .collect();
        println!("  {} {} waits on {}", "blocked".yellow(), unit.id, blockers.join(", "));
    }
    for risk in &risks {
        println!(
            "  {} {} and {} overlap on {}",
            "conflict risk".magenta(),
            risk.unit_id,
            risk.other,
            risk.paths.join(", ")
        );
    }
    Ok(())
}

async fn handle_workspaces(config: &OrchestratorConfig, json: bool) -> anyhow::Result<()> {
    let manager = WorkspaceManager::from_config(Arc::new(GitWorktreeBackend::new()), config);
    let listed = manager.list_repository().await?;

    if json {
        let out: Vec<_> = listed
            .iter()
            .map(|ws| serde_json::json!({ "path": ws.path, "branch": ws.branch }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if listed.is_empty() {
        println!("{}", "No isolated workspaces".dimmed());
    }
    for ws in &listed {
        println!(
            "{}  {}",
            ws.path.display().to_string().bright_white(),
            ws.branch.as_deref().unwrap_or("(detached)").cyan()
        );
    }
    Ok(())
}

async fn handle_reconcile(config: OrchestratorConfig, store_path: &Path, json: bool) -> anyhow::Result<()> {
    config.validate()?;
    let store = Arc::new(JsonlIssueStore::open(store_path).await?);
    let workspaces = Arc::new(WorkspaceManager::from_config(Arc::new(GitWorktreeBackend::new()), &config));
    let coordinator = Arc::new(
        AssignmentCoordinator::new(config, workspaces, EventSink::disabled()).with_store(store.clone()),
    );

    coordinator.load_units(store.list_all().await?).await?;
    let adopted = coordinator.adopt_workspaces().await?;
    let report = ProgressMonitor::new(coordinator).scan_at(Utc::now()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, adopted);
    }
    Ok(())
}

fn print_report(report: &ScanReport, adopted: usize) {
    println!("{}", "Reconcile".bright_blue().bold());
    println!("Adopted workspaces: {}", adopted);
    println!("Assignments scanned: {}", report.scanned);
    for stale in &report.stale {
        let action = if stale.reclaimed { "reclaimed" } else { "flagged" };
        let line = format!(
            "  stale {} held by {} idle {}s ({})",
            stale.unit_id, stale.agent_id, stale.idle_secs, action
        );
        if stale.dirty {
            println!("{}", line.red());
        } else {
            println!("{}", line.yellow());
        }
    }
    for unit in &report.lifetime_exceeded {
        println!("  {} {}", "lifetime exceeded".red(), unit);
    }
    for path in &report.orphans_removed {
        println!("  {} {}", "orphan removed".yellow(), path.display());
    }
    for violation in &report.invariant_violations {
        println!("  {} {}", "invariant".red().bold(), violation);
    }
    for agent in &report.agents_deregistered {
        println!("  {} {}", "deregistered".yellow(), agent);
    }
    if report.is_clean() {
        println!("{}", "Nothing to do".green());
    }
}
