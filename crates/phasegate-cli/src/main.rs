//! Phasegate CLI - phase-gated, budget-aware task orchestration
//!
//! Usage:
//!   phasegate init                          Initialize Phasegate in a project
//!   phasegate create <spec.json>            Create a workflow from a spec file
//!   phasegate status <workflow>             Show workflow status
//!   phasegate claim <workflow> --agent A    Dispatch the next ready task
//!   phasegate progress <workflow> <task>    Record a worker report
//!   phasegate approve <workflow> <phase>    Approve the current phase

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use phasegate_core::config::STATE_DIR;
use phasegate_core::{
    PhasegateConfig, ProgressEntry, Task, TaskStatus, TokenUsage, WorkflowSpec,
};
use phasegate_orchestrator::{ActivityLogger, Engine, Signal};
use phasegate_store::JournalStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(author, version, about = "Phase-gated, budget-aware task orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project root holding the .phasegate directory
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Phasegate (writes .phasegate/config.toml)
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Create a workflow from a JSON spec file
    Create {
        /// Workflow spec (JSON)
        spec: PathBuf,
    },

    /// List workflows
    Workflows,

    /// Show workflow status
    Status { workflow: String },

    /// List a workflow's tasks in scheduling order
    Tasks { workflow: String },

    /// Show one task with its history (JSON)
    Task { task: String },

    /// Show the next ready task without claiming it
    Next { workflow: String },

    /// Claim the next ready task for an agent
    Claim {
        workflow: String,

        /// Agent identifier
        #[arg(long)]
        agent: String,
    },

    /// Start a specific task for an agent
    Start {
        workflow: String,
        task: String,

        /// Agent identifier
        #[arg(long)]
        agent: String,
    },

    /// Record a progress report for a task
    Progress {
        workflow: String,
        task: String,

        /// Agent identifier
        #[arg(long)]
        agent: String,

        /// What was attempted
        #[arg(long)]
        action: String,

        /// "success", "failed: <reason>" or "blocked"
        #[arg(long)]
        outcome: String,

        /// Worker tier used for pricing (opus, sonnet, haiku)
        #[arg(long)]
        tier: Option<String>,

        #[arg(long, default_value = "0")]
        input_tokens: u64,

        #[arg(long, default_value = "0")]
        output_tokens: u64,

        /// Artifact produced (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,

        /// Blocker encountered (repeatable)
        #[arg(long = "blocker")]
        blockers: Vec<String>,
    },

    /// Approve the current phase
    Approve { workflow: String, phase: String },

    /// Reject the current phase back to open
    Reject {
        workflow: String,
        phase: String,
        reason: String,
    },

    /// Close a tripped cost breaker
    ResetBreaker { workflow: String },

    /// Change a workflow's budget cap (USD)
    Budget { workflow: String, budget_usd: f64 },

    /// Defer a task
    Defer {
        workflow: String,
        task: String,

        #[arg(long, default_value = "deferred by operator")]
        note: String,
    },

    /// Reopen a completed, deferred or blocked task
    Reopen {
        workflow: String,
        task: String,
        reason: String,
    },

    /// Report stale in-progress tasks
    Sweep { workflow: String },

    /// Verify ledger invariants and locked-phase fingerprints
    Verify {
        workflow: String,

        /// Compact the journal afterwards
        #[arg(long)]
        compact: bool,
    },

    /// Abort a workflow
    Abort { workflow: String, reason: String },

    /// Archive a completed or aborted workflow
    Archive { workflow: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let root = cli.root;
    match cli.command {
        Commands::Init { force } => cmd_init(&root, force).await,
        Commands::Create { spec } => cmd_create(&root, spec).await,
        Commands::Workflows => cmd_workflows(&root).await,
        Commands::Status { workflow } => cmd_status(&root, &workflow).await,
        Commands::Tasks { workflow } => cmd_tasks(&root, &workflow).await,
        Commands::Task { task } => cmd_task(&root, &task).await,
        Commands::Next { workflow } => cmd_next(&root, &workflow).await,
        Commands::Claim { workflow, agent } => cmd_claim(&root, &workflow, &agent).await,
        Commands::Start {
            workflow,
            task,
            agent,
        } => cmd_start(&root, &workflow, &task, &agent).await,
        Commands::Progress {
            workflow,
            task,
            agent,
            action,
            outcome,
            tier,
            input_tokens,
            output_tokens,
            artifacts,
            blockers,
        } => {
            let mut entry = ProgressEntry::new(agent, action, outcome)
                .with_artifacts(artifacts)
                .with_blockers(blockers);
            if let Some(tier) = tier {
                entry = entry.with_tokens(TokenUsage::new(tier, input_tokens, output_tokens));
            } else if input_tokens > 0 || output_tokens > 0 {
                bail!("--tier is required when reporting token usage");
            }
            cmd_progress(&root, &workflow, &task, entry).await
        }
        Commands::Approve { workflow, phase } => cmd_approve(&root, &workflow, &phase).await,
        Commands::Reject {
            workflow,
            phase,
            reason,
        } => cmd_reject(&root, &workflow, &phase, &reason).await,
        Commands::ResetBreaker { workflow } => cmd_reset_breaker(&root, &workflow).await,
        Commands::Budget {
            workflow,
            budget_usd,
        } => cmd_budget(&root, &workflow, budget_usd).await,
        Commands::Defer {
            workflow,
            task,
            note,
        } => cmd_defer(&root, &workflow, &task, &note).await,
        Commands::Reopen {
            workflow,
            task,
            reason,
        } => cmd_reopen(&root, &workflow, &task, &reason).await,
        Commands::Sweep { workflow } => cmd_sweep(&root, &workflow).await,
        Commands::Verify { workflow, compact } => cmd_verify(&root, &workflow, compact).await,
        Commands::Abort { workflow, reason } => cmd_abort(&root, &workflow, &reason).await,
        Commands::Archive { workflow } => cmd_archive(&root, &workflow).await,
    }
}

/// Open the journal and build an engine over it
async fn open_engine(root: &Path) -> Result<Engine<JournalStore>> {
    let state_dir = root.join(STATE_DIR);
    let config = PhasegateConfig::load_or_default(root).context("Failed to load config")?;
    let store = JournalStore::open(state_dir.join("ledger.jsonl"))
        .await
        .context("Failed to open ledger journal")?;

    Ok(Engine::new(Arc::new(store), config).with_activity_log(ActivityLogger::new(state_dir)))
}

fn print_signals(signals: &[Signal]) {
    for signal in signals {
        println!("  ! {}", signal);
    }
}

fn print_task_line(task: &Task) {
    let assignee = task
        .assignee
        .as_deref()
        .map(|a| format!(" @{}", a))
        .unwrap_or_default();
    println!(
        "  [{}] {:<16} {:<12} {:<8} {}{}",
        task.status, task.task_id, task.phase, task.priority, task.title, assignee
    );
}

async fn cmd_init(root: &Path, force: bool) -> Result<()> {
    info!("Initializing Phasegate in {:?}", root);

    let config_path = root.join(STATE_DIR).join("config.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    PhasegateConfig::write_default(root).context("Failed to write default config")?;

    println!("Initialized Phasegate in {:?}", root);
    println!("Created:");
    println!("  {}/config.toml", STATE_DIR);
    println!("\nNext steps:");
    println!("  1. Adjust pricing and budgets in {}/config.toml", STATE_DIR);
    println!("  2. Run 'phasegate create <spec.json>' to start a workflow");
    Ok(())
}

async fn cmd_create(root: &Path, spec_path: PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(&spec_path)
        .await
        .with_context(|| format!("Failed to read spec file {:?}", spec_path))?;
    let spec: WorkflowSpec =
        serde_json::from_str(&content).context("Failed to parse workflow spec JSON")?;

    let engine = open_engine(root).await?;
    let workflow = engine
        .create_workflow(spec)
        .await
        .context("Failed to create workflow")?;

    println!("Created workflow {}", workflow.workflow_id);
    for phase in &workflow.phases {
        let marker = if phase.immutable { " (immutable)" } else { "" };
        println!("  {} [{}]{}", phase.name, phase.lock, marker);
    }
    println!("Tasks: {}", workflow.task_ids.len());
    println!("Budget: ${:.2}", workflow.budget.budget_usd);
    Ok(())
}

async fn cmd_workflows(root: &Path) -> Result<()> {
    let engine = open_engine(root).await?;
    let workflows = engine.list_workflows().await?;

    if workflows.is_empty() {
        println!("No workflows");
        return Ok(());
    }
    for workflow in workflows {
        let phase = workflow
            .current_phase()
            .map(|p| p.name.as_str())
            .unwrap_or("-");
        let archived = if workflow.archived_at.is_some() { " (archived)" } else { "" };
        println!(
            "  {:<20} {:<9} phase={:<12} ${:.2}/${:.2}{}",
            workflow.workflow_id,
            workflow.status,
            phase,
            workflow.budget.spent_usd,
            workflow.budget.budget_usd,
            archived
        );
    }
    Ok(())
}

async fn cmd_status(root: &Path, workflow_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let view = engine
        .get_workflow_status(workflow_id)
        .await
        .with_context(|| format!("Failed to load workflow {}", workflow_id))?;

    println!("Workflow {}", view.workflow_id);
    println!("==========");
    println!("Status:   {}", view.status);
    match (&view.phase, view.phase_lock_state) {
        (Some(phase), Some(lock)) => println!("Phase:    {} [{}]", phase, lock),
        _ => println!("Phase:    all phases locked"),
    }
    println!("Breaker:  {}", view.breaker_state);
    println!("Spend:    ${:.4} of ${:.2}", view.spent_usd, view.budget_usd);
    println!("\nTasks ({}):", view.total_tasks);
    for (status, count) in &view.task_counts {
        println!("  {:<15} {}", status.to_string(), count);
    }
    Ok(())
}

async fn cmd_tasks(root: &Path, workflow_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let tasks = engine.list_tasks(workflow_id).await?;

    if tasks.is_empty() {
        println!("No tasks in workflow {}", workflow_id);
    }
    for task in &tasks {
        print_task_line(task);
    }
    Ok(())
}

async fn cmd_task(root: &Path, task_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let task = engine.get_task(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn cmd_next(root: &Path, workflow_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    match engine.next_actionable(workflow_id).await? {
        Some(task) => print_task_line(&task),
        None => println!("No task ready in workflow {}", workflow_id),
    }
    Ok(())
}

async fn cmd_claim(root: &Path, workflow_id: &str, agent: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    match engine.claim_next(workflow_id, agent).await? {
        Some(task) => {
            println!("Claimed {} for {}", task.task_id, agent);
            print_task_line(&task);
        }
        None => println!("No task ready in workflow {}", workflow_id),
    }
    Ok(())
}

async fn cmd_start(root: &Path, workflow_id: &str, task_id: &str, agent: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let task = engine.start_task(workflow_id, task_id, agent).await?;
    println!("Started {} for {}", task.task_id, agent);
    Ok(())
}

async fn cmd_progress(
    root: &Path,
    workflow_id: &str,
    task_id: &str,
    entry: ProgressEntry,
) -> Result<()> {
    let engine = open_engine(root).await?;
    let outcome = engine
        .submit_progress(workflow_id, task_id, entry)
        .await
        .with_context(|| format!("Failed to record progress for {}", task_id))?;

    let task = engine.get_task(task_id).await?;
    println!("Recorded progress for {} (now {})", task_id, task.status);
    print_signals(&outcome.signals);
    match outcome.next_task {
        Some(next) => {
            println!("Next:");
            print_task_line(&next);
        }
        None => println!("No task ready"),
    }
    Ok(())
}

async fn cmd_approve(root: &Path, workflow_id: &str, phase: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let signals = engine
        .approve_phase(workflow_id, phase)
        .await
        .with_context(|| format!("Failed to approve phase {}", phase))?;

    println!("Approved and locked phase {}", phase);
    print_signals(&signals);
    Ok(())
}

async fn cmd_reject(root: &Path, workflow_id: &str, phase: &str, reason: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    engine
        .reject_phase(workflow_id, phase, reason)
        .await
        .with_context(|| format!("Failed to reject phase {}", phase))?;
    println!("Rejected phase {}: {}", phase, reason);
    Ok(())
}

async fn cmd_reset_breaker(root: &Path, workflow_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let signals = engine.reset_breaker(workflow_id).await?;
    let workflow = engine.get_workflow(workflow_id).await?;

    println!(
        "Breaker reset for {} (spent ${:.4} of ${:.2})",
        workflow_id, workflow.budget.spent_usd, workflow.budget.budget_usd
    );
    if workflow.budget.fraction() >= 1.0 {
        println!("  Still over budget: the next reported spend trips it again");
    }
    print_signals(&signals);
    Ok(())
}

async fn cmd_budget(root: &Path, workflow_id: &str, budget_usd: f64) -> Result<()> {
    let engine = open_engine(root).await?;
    let signals = engine.adjust_budget(workflow_id, budget_usd).await?;
    let workflow = engine.get_workflow(workflow_id).await?;
    println!(
        "Budget for {} is now ${:.2} (breaker {})",
        workflow_id, workflow.budget.budget_usd, workflow.budget.breaker_state
    );
    print_signals(&signals);
    Ok(())
}

async fn cmd_defer(root: &Path, workflow_id: &str, task_id: &str, note: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let signals = engine
        .override_status(workflow_id, task_id, TaskStatus::Deferred, note)
        .await?;
    println!("Deferred {}", task_id);
    print_signals(&signals);
    Ok(())
}

async fn cmd_reopen(root: &Path, workflow_id: &str, task_id: &str, reason: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let task = engine.reopen_task(workflow_id, task_id, reason).await?;
    println!("Reopened {} (now {})", task.task_id, task.status);
    Ok(())
}

async fn cmd_sweep(root: &Path, workflow_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    let signals = engine.sweep_stale(workflow_id, Utc::now()).await?;
    if signals.is_empty() {
        println!("No stale tasks in {}", workflow_id);
    }
    print_signals(&signals);
    Ok(())
}

async fn cmd_verify(root: &Path, workflow_id: &str, compact: bool) -> Result<()> {
    let engine = open_engine(root).await?;
    engine
        .verify_integrity(workflow_id)
        .await
        .with_context(|| format!("Integrity check failed for {}", workflow_id))?;
    println!("Workflow {} verified", workflow_id);

    if compact {
        let store = engine.store();
        let before = store.record_count().await;
        store.compact().await.context("Failed to compact journal")?;
        println!(
            "Compacted journal: {} -> {} records",
            before,
            store.record_count().await
        );
    }
    Ok(())
}

async fn cmd_abort(root: &Path, workflow_id: &str, reason: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    engine.abort_workflow(workflow_id, reason).await?;
    println!("Aborted workflow {}: {}", workflow_id, reason);
    Ok(())
}

async fn cmd_archive(root: &Path, workflow_id: &str) -> Result<()> {
    let engine = open_engine(root).await?;
    engine.archive_workflow(workflow_id).await?;
    println!("Archived workflow {}", workflow_id);
    Ok(())
}
