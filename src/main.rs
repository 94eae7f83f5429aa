//! Taskline - phased task-graph execution for coding agents

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use taskline::ledger::questions::{QuestionLedger, QuestionStatus};
use taskline::{
    build_phases, AgentClient, ClaudeCliAgent, ExecConfig, ExecutionDriver, GitCheckpointer,
    Ledger, PhaseState, Result, RunReport, TaskOutcome, TaskRunner, TaskStatus, TasklineError,
    UnitLayout,
};

#[derive(Parser)]
#[command(name = "taskline")]
#[command(version)]
#[command(about = "Execute phased task ledgers with a coding agent", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every phase of a unit
    Execute {
        /// Unit name (directory under .taskline/)
        unit: String,

        /// Concurrent task attempts per phase
        #[arg(long, value_name = "N")]
        max_parallel: Option<usize>,

        /// Retries after a failed attempt
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,

        /// Time budget per attempt in seconds
        #[arg(long, value_name = "SECS")]
        task_timeout: Option<u64>,

        /// Model passed to the agent
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Send the plain instruction without a briefing pass
        #[arg(long)]
        no_briefing: bool,

        /// Disable every optional gate (commits still happen)
        #[arg(long)]
        no_gates: bool,
    },

    /// Run a single attempt at one task
    RunTask {
        unit: String,

        /// Task id; inferred when exactly one task is runnable
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Show progress and the phase breakdown
    Status { unit: String },

    /// Reset tasks left running by an interrupted run
    Recover { unit: String },

    /// Set a task's status by hand
    SetStatus {
        unit: String,
        id: String,
        /// pending, running, completed, failed or skipped
        status: String,
    },

    /// List open questions raised during execution
    Questions {
        unit: String,

        /// Include answered questions
        #[arg(long)]
        all: bool,
    },

    /// Record the answer to an open question
    Answer {
        unit: String,
        /// Question id, e.g. Q3
        id: String,
        answer: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "taskline=debug"
    } else {
        "taskline=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let project = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project.is_dir() {
        return Err(TasklineError::MissingFile { path: project });
    }

    match cli.command {
        Commands::Execute {
            unit,
            max_parallel,
            max_retries,
            task_timeout,
            model,
            no_briefing,
            no_gates,
        } => {
            let mut config = ExecConfig::load(&project)?;
            if let Some(n) = max_parallel {
                config.max_parallel = n;
            }
            if let Some(n) = max_retries {
                config.max_retries = n;
            }
            if let Some(secs) = task_timeout {
                config.task_timeout_secs = secs;
            }
            if model.is_some() {
                config.model = model;
            }
            if no_briefing {
                config.briefing = false;
            }
            if no_gates {
                config.gates = taskline::GateConfig::none();
            }
            config.validate()?;
            execute(&project, &unit, &config).await
        }
        Commands::RunTask { unit, task } => run_task(&project, &unit, task.as_deref()).await,
        Commands::Status { unit } => status(&project, &unit),
        Commands::Recover { unit } => {
            let layout = ready_layout(&project, &unit)?;
            let recovered = Ledger::open(layout.tasks_path()).reset_running()?;
            if recovered.is_empty() {
                println!("{} No interrupted tasks", "OK".green().bold());
            } else {
                println!(
                    "{} Reset to pending: {}",
                    "OK".green().bold(),
                    recovered.join(", ")
                );
            }
            Ok(())
        }
        Commands::SetStatus { unit, id, status } => {
            let layout = ready_layout(&project, &unit)?;
            Ledger::open(layout.tasks_path()).update_status_str(&id, &status)?;
            println!("{} {} -> {}", "OK".green().bold(), id, status.to_lowercase());
            Ok(())
        }
        Commands::Questions { unit, all } => questions(&project, &unit, all),
        Commands::Answer { unit, id, answer } => {
            let layout = ready_layout(&project, &unit)?;
            QuestionLedger::open(layout.questions_path()).answer(&id, &answer, false)?;
            println!("{} {} answered", "OK".green().bold(), id);
            Ok(())
        }
    }
}

fn ready_layout(project: &Path, unit: &str) -> Result<UnitLayout> {
    let layout = UnitLayout::resolve(project, unit);
    layout.ensure_ready()?;
    Ok(layout)
}

fn claude_agent(config: &ExecConfig) -> Result<Arc<dyn AgentClient>> {
    let agent = ClaudeCliAgent::new();
    if !agent.is_available() {
        return Err(TasklineError::config("the 'claude' CLI is not installed or not in PATH"));
    }
    let agent = match &config.model {
        Some(model) => agent.with_default_model(model),
        None => agent,
    };
    Ok(Arc::new(agent))
}

async fn execute(project: &Path, unit: &str, config: &ExecConfig) -> Result<()> {
    let layout = ready_layout(project, unit)?;
    let agent = claude_agent(config)?;
    let driver = ExecutionDriver::new(
        layout,
        config,
        agent,
        Arc::new(GitCheckpointer::new(project)),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let report = driver.run(&cancel).await?;
    print_report(&report);
    Ok(())
}

async fn run_task(project: &Path, unit: &str, task: Option<&str>) -> Result<()> {
    let layout = ready_layout(project, unit)?;
    let config = ExecConfig::load(project)?;
    let agent = claude_agent(&config)?;
    let runner = TaskRunner::new(layout, agent, &config);

    let attempt = runner.run_task(task, None).await?;
    println!("{} Task {} completed", "OK".green().bold(), attempt.task_id);
    if let Some(path) = attempt.transcript {
        println!("  transcript: {}", path.display());
    }
    Ok(())
}

fn paint_state(state: PhaseState) -> ColoredString {
    let label = state.to_string();
    match state {
        PhaseState::Completed => label.green().bold(),
        PhaseState::Partial | PhaseState::Blocked => label.yellow().bold(),
        PhaseState::Failed => label.red().bold(),
        PhaseState::Cancelled => label.magenta().bold(),
        PhaseState::Skipped => label.dimmed(),
    }
}

fn paint_status(status: TaskStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        TaskStatus::Completed => label.green(),
        TaskStatus::Failed => label.red(),
        TaskStatus::Running => label.cyan(),
        TaskStatus::Skipped => label.dimmed(),
        TaskStatus::Pending => label.normal(),
    }
}

fn print_report(report: &RunReport) {
    println!("\n{}", "Run summary".bold());
    if !report.recovered.is_empty() {
        println!("  recovered: {}", report.recovered.join(", "));
    }

    for phase in &report.phases {
        let commit = phase
            .commit
            .as_deref()
            .map(|c| format!(" [{}]", &c[..c.len().min(10)]))
            .unwrap_or_default();
        println!(
            "  Phase {:>3}  {:<10} {} ok, {} failed, {} blocked{}",
            phase.group,
            paint_state(phase.state),
            phase.succeeded,
            phase.failed,
            phase.blocked,
            commit
        );
        for task in &phase.tasks {
            if let TaskOutcome::Failed { error } = &task.outcome {
                let first_line = error.lines().next().unwrap_or_default();
                println!(
                    "      {} {} after {} attempt(s): {}",
                    "✗".red(),
                    task.task_id,
                    task.attempts,
                    first_line
                );
            }
        }
    }

    if let Some(commit) = &report.docs_commit {
        println!("  docs aligned [{}]", &commit[..commit.len().min(10)]);
    }
    if report.cancelled {
        println!("  {}", "run cancelled".magenta().bold());
    }
    println!("\n{} {}", "Progress:".bold(), report.progress);
}

fn status(project: &Path, unit: &str) -> Result<()> {
    let layout = ready_layout(project, unit)?;
    let ledger = Ledger::open(layout.tasks_path());
    let tasks = ledger.load()?;
    let phases = build_phases(&tasks)?;

    println!("{} {}", "Unit".bold(), layout.name());
    for phase in &phases {
        let done = phase.tasks.iter().filter(|t| t.status.is_done()).count();
        println!(
            "\n  Phase {} ({}/{} done)",
            phase.group,
            done,
            phase.tasks.len()
        );
        for task in &phase.tasks {
            println!(
                "    {:<10} {:<8} {}",
                paint_status(task.status),
                task.id,
                task.title
            );
        }
        for overlap in phase.file_overlaps() {
            println!(
                "    {} {} shared by {}",
                "!".yellow(),
                overlap.file,
                overlap.task_ids.join(", ")
            );
        }
    }

    println!("\n{} {}", "Progress:".bold(), ledger.progress()?);
    Ok(())
}

fn questions(project: &Path, unit: &str, all: bool) -> Result<()> {
    let layout = ready_layout(project, unit)?;
    let ledger = QuestionLedger::open(layout.questions_path());
    let questions = if all { ledger.load()? } else { ledger.unanswered()? };

    if questions.is_empty() {
        println!("{} No open questions", "OK".green().bold());
        return Ok(());
    }

    for q in questions {
        let status = match q.status {
            QuestionStatus::Unanswered => q.status.to_string().yellow(),
            QuestionStatus::AutoAnswered => q.status.to_string().cyan(),
            QuestionStatus::Answered => q.status.to_string().green(),
        };
        println!("{} [{}] {}", q.id.bold(), status, q.question);
        if let Some(task) = &q.task {
            println!("    task: {task}");
        }
        if !q.context.is_empty() {
            println!("    context: {}", q.context.replace('\n', " "));
        }
        if let Some(answer) = &q.answer {
            println!("    answer: {answer}");
        }
    }
    Ok(())
}
