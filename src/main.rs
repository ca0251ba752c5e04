use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use issue_orchestrator_lib::config::{PartialConfig, PartialRetry};
use issue_orchestrator_lib::orchestrator::report::EXIT_FATAL;
use issue_orchestrator_lib::shutdown::{register_signal_handlers, ShutdownState};
use issue_orchestrator_lib::{
    load_config, CommandAgent, DependencyGraph, Orchestrator, OrchestratorConfig, RunReport,
    ScopeLockManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Issue Orchestrator - run an agent over a dependency graph of issues in parallel git worktrees
#[derive(Parser, Debug)]
#[command(name = "issue-orchestrator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository to operate on
    #[arg(long, short = 'C', default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every issue of a dependency graph
    Run(RunArgs),

    /// List held scope locks
    Locks,

    /// Force-release the scope lock of a holder
    Unlock {
        /// Holder id (the run id for orchestrator runs)
        holder: String,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Dependency graph file (YAML, or JSON with a .json extension)
    #[arg(required_unless_present = "resume")]
    graph: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long, env = "ISSUE_ORCHESTRATOR_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Per-issue agent timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Attempts before an issue fails permanently
    #[arg(long)]
    max_retries: Option<u32>,

    /// Path scope claimed by this run (repeatable; default is the whole repository)
    #[arg(long = "scope")]
    scopes: Vec<String>,

    /// Wait for overlapping runs to finish instead of failing
    #[arg(long)]
    queue: bool,

    /// Upper bound for --queue, in seconds
    #[arg(long)]
    queue_timeout: Option<u64>,

    /// Resume a previous run (the most recent one when no id is given)
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    resume: Option<String>,

    /// Integration branch (default: the repository's current branch)
    #[arg(long)]
    branch: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Agent command, after `--`; `{issue}` and `{workspace}` are substituted
    #[arg(last = true, required = true)]
    agent: Vec<String>,
}

impl RunArgs {
    fn overrides(&self) -> PartialConfig {
        PartialConfig {
            max_workers: self.max_workers,
            item_timeout_secs: self.timeout,
            retry: self.max_retries.map(|max_retries| PartialRetry {
                max_retries: Some(max_retries),
                ..Default::default()
            }),
            scopes: (!self.scopes.is_empty()).then(|| self.scopes.clone()),
            queue_on_scope_conflict: self.queue.then_some(true),
            scope_wait_timeout_secs: self.queue_timeout,
            integration_branch: self.branch.clone(),
            ..Default::default()
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

fn execute(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Run(args) => run(&cli.repo, args),
        Command::Locks => list_locks(&cli.repo),
        Command::Unlock { holder } => unlock(&cli.repo, &holder),
    }
}

fn run(repo: &Path, args: RunArgs) -> anyhow::Result<i32> {
    let config = load_config(repo, args.overrides())?;
    let agent = CommandAgent::from_command_line(&args.agent)?;
    log::info!("Using agent {}", agent.program().display());

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let shutdown_state = ShutdownState::new();
        if let Err(e) = register_signal_handlers(shutdown_state.clone()) {
            log::warn!("Failed to register signal handlers: {}", e);
        }

        let orchestrator =
            Orchestrator::new(repo, config, Arc::new(agent), shutdown_state.clone())?;

        let report = match args.resume.as_deref() {
            Some(run_id) => {
                let run_id = (!run_id.is_empty()).then_some(run_id);
                orchestrator.resume(run_id).await?
            }
            None => {
                let Some(graph_path) = args.graph.as_deref() else {
                    bail!("a dependency graph file is required");
                };
                let graph = DependencyGraph::from_file(graph_path)?;
                orchestrator.run(&graph).await?
            }
        };

        shutdown_state.mark_cleanup_complete();
        print_report(&report, args.json)?;
        Ok::<_, anyhow::Error>(report.exit_code())
    })
}

fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn lock_manager(repo: &Path) -> anyhow::Result<ScopeLockManager> {
    let config = load_config(repo, PartialConfig::default())?;
    let git_dir = issue_orchestrator_lib::git::GitManager::new(repo)
        .with_context(|| format!("Cannot open repository at {}", repo.display()))?
        .repo_path();
    Ok(ScopeLockManager::new(config.lock_dir_for(&git_dir)))
}

fn list_locks(repo: &Path) -> anyhow::Result<i32> {
    let locks = lock_manager(repo)?.list_locks()?;
    if locks.is_empty() {
        println!("No scope locks held");
    }
    for (record, stale) in locks {
        println!(
            "{}  pid {} on {}  since {}  {:?}{}",
            record.holder,
            record.pid,
            record.host,
            record.acquired_at.to_rfc3339(),
            record.scopes,
            if stale { "  (stale)" } else { "" }
        );
    }
    Ok(0)
}

fn unlock(repo: &Path, holder: &str) -> anyhow::Result<i32> {
    if lock_manager(repo)?.force_release(holder)? {
        println!("Released scope lock of {}", holder);
        Ok(0)
    } else {
        println!("No scope lock held by {}", holder);
        Ok(1)
    }
}
