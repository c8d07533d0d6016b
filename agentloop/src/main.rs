//! `agentloop` command line.
//!
//! Runs supervised agent attempts against a project root, one at a time (`exec`) or
//! over a task file (`run`), and manages the checkpoints and process ledger they
//! leave behind.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentloop::cancel::CancelToken;
use agentloop::exit_codes;
use agentloop::executor::{AgentExecutor, ExecError, ExecOptions, ExecutionContext};
use agentloop::io::checkpoint::CheckpointStore;
use agentloop::io::config::{LoopConfig, config_path, load_config, write_config};
use agentloop::io::process::reclaim_ledger_orphans;
use agentloop::looping::{LoopSettings, TaskOutcome, TaskReport, load_tasks, run_loop};
use agentloop::resume::{ResumeOutcome, resume};
use agentloop::{executor, logging};
use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "agentloop",
    version,
    about = "Resilient, resumable execution loop for coding agents"
)]
struct Cli {
    /// Project root (config, checkpoints and the process ledger live under `.agentloop/`).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Config file; defaults to `<root>/.agentloop/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for this crate (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one attempt. The prompt comes from `--prompt` or stdin.
    Exec(ExecArgs),
    /// Run every task in a JSON task file.
    Run(RunArgs),
    /// Report how an agent would resume from its checkpoint.
    Resume { agent_id: String },
    /// Delete an agent's checkpoint.
    Clear { agent_id: String },
    /// Terminate processes left behind by crashed sessions.
    Reap,
}

#[derive(Args)]
struct ExecArgs {
    #[arg(long)]
    prompt: Option<String>,
    /// Partition key (`namespace` or `namespace/kind`).
    #[arg(long)]
    key: Option<String>,
    /// Checkpoint owner.
    #[arg(long)]
    agent_id: Option<String>,
    /// Model override.
    #[arg(long)]
    model: Option<String>,
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,
    /// Attempt log destination.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Diff base for artifact detection.
    #[arg(long)]
    base_ref: Option<String>,
    /// Print the full attempt report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    tasks: PathBuf,
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
    /// Longest total wait for a key's circuit to close before giving up on a task.
    #[arg(long, default_value_t = 300)]
    max_circuit_wait_secs: u64,
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,
    /// Attempt log directory; defaults to `<root>/.agentloop/logs`.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Print the loop report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_file = cli.config.clone().unwrap_or_else(|| config_path(&cli.root));
    match cli.command {
        Command::Init { force } => cmd_init(&config_file, force),
        Command::Exec(args) => {
            let config = load_config(&config_file)?;
            cmd_exec(config, &cli.root, &args)
        }
        Command::Run(args) => {
            let config = load_config(&config_file)?;
            cmd_run(config, &cli.root, &args)
        }
        Command::Resume { agent_id } => {
            let config = load_config(&config_file)?;
            cmd_resume(&config, &cli.root, &agent_id)
        }
        Command::Clear { agent_id } => {
            let config = load_config(&config_file)?;
            let store = CheckpointStore::new(config.checkpoint_dir(&cli.root));
            if store.clear(&agent_id)? {
                println!("cleared {agent_id}");
                Ok(exit_codes::OK)
            } else {
                println!("no checkpoint for {agent_id}");
                Ok(exit_codes::NOT_FOUND)
            }
        }
        Command::Reap => {
            let config = load_config(&config_file)?;
            let reclaimed =
                reclaim_ledger_orphans(&executor::ledger_dir(&cli.root), config.agent.kill_grace())?;
            for record in &reclaimed {
                println!("{}\t{}", record.pid, record.command);
            }
            println!("reclaimed {} process(es)", reclaimed.len());
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &LoopConfig::default())
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_exec(config: LoopConfig, root: &Path, args: &ExecArgs) -> Result<i32> {
    let prompt = match &args.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        return Err(anyhow!("empty prompt (pass --prompt or pipe it on stdin)"));
    }

    let cancel = interrupt_token()?;
    let ctx = ExecutionContext::init(config, root)?;
    let executor = AgentExecutor::new(&ctx);
    let options = ExecOptions {
        cancel: Some(cancel),
        key: args.key.clone(),
        agent_id: args.agent_id.clone(),
        model: args.model.clone(),
        base_ref: args.base_ref.clone(),
        ..ExecOptions::default()
    };
    let outcome = executor.execute(
        &prompt,
        args.output.as_deref(),
        args.timeout_secs.map(Duration::from_secs),
        &options,
    );
    ctx.teardown();

    match outcome {
        Ok(report) => {
            if args.json {
                print_json(&report)?;
            } else {
                println!(
                    "{:?}\texit={}\t{}",
                    report.result.status,
                    report
                        .exit_code
                        .map_or_else(|| "-".to_string(), |c| c.to_string()),
                    report.result.summary
                );
            }
            Ok(if report.made_progress() {
                exit_codes::OK
            } else {
                exit_codes::FAILED
            })
        }
        Err(err) => {
            eprintln!("{err}");
            if args.json
                && let Some(report) = err.report()
            {
                print_json(report)?;
            }
            Ok(exec_error_code(&err))
        }
    }
}

fn exec_error_code(err: &ExecError) -> i32 {
    match err {
        ExecError::CircuitOpen(_) | ExecError::ConcurrencyRejected(_) => exit_codes::REJECTED,
        ExecError::Timeout { .. } => exit_codes::TIMED_OUT,
        ExecError::Spawn(_) => exit_codes::FAILED,
        ExecError::Cancelled { .. } => exit_codes::CANCELLED,
        ExecError::Io(_) => exit_codes::INVALID,
    }
}

fn cmd_run(config: LoopConfig, root: &Path, args: &RunArgs) -> Result<i32> {
    if args.max_attempts == 0 {
        return Err(anyhow!("--max-attempts must be > 0"));
    }
    let tasks = load_tasks(&args.tasks)?;
    let settings = LoopSettings {
        max_attempts: args.max_attempts,
        max_circuit_wait: Duration::from_secs(args.max_circuit_wait_secs),
        timeout: args.timeout_secs.map(Duration::from_secs),
        log_dir: Some(
            args.log_dir
                .clone()
                .unwrap_or_else(|| root.join(".agentloop").join("logs")),
        ),
        cancel: interrupt_token()?,
        ..LoopSettings::default()
    };

    let ctx = ExecutionContext::init(config, root)?;
    let executor = AgentExecutor::new(&ctx);
    let print_line = |task: &TaskReport| {
        if !args.json {
            println!("{}\t{}\t{}", task.task_id, task.key, outcome_label(&task.outcome));
        }
    };
    let report = run_loop(&executor, tasks, &settings, &print_line);
    ctx.teardown();
    let report = report?;

    if args.json {
        print_json(&report)?;
    } else {
        println!(
            "completed {}, failed {}, rejected {}",
            report.completed(),
            report.failed(),
            report.rejected()
        );
        for task in &report.tasks {
            for follow_up in &task.follow_ups {
                println!("follow-up ({}): {}", task.task_id, follow_up.title);
            }
        }
    }
    Ok(if report.cancelled() > 0 {
        exit_codes::CANCELLED
    } else if report.failed() > 0 {
        exit_codes::FAILED
    } else if report.rejected() > 0 {
        exit_codes::REJECTED
    } else {
        exit_codes::OK
    })
}

fn outcome_label(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Completed { attempts, status } => {
            format!("completed ({status:?}, {attempts} attempt(s))")
        }
        TaskOutcome::AlreadyCompleted => "already completed".to_string(),
        TaskOutcome::Skipped => "skipped".to_string(),
        TaskOutcome::Exhausted { attempts } => format!("exhausted after {attempts} attempt(s)"),
        TaskOutcome::Rejected { reason, .. } => format!("rejected: {reason}"),
        TaskOutcome::Cancelled { .. } => "cancelled".to_string(),
        TaskOutcome::Failed { reason, .. } => format!("failed: {reason}"),
    }
}

fn cmd_resume(config: &LoopConfig, root: &Path, agent_id: &str) -> Result<i32> {
    let store = CheckpointStore::new(config.checkpoint_dir(root));
    match resume(&store, agent_id) {
        ResumeOutcome::Resumed { message, .. } => {
            println!("resumed: {message}");
            Ok(exit_codes::OK)
        }
        ResumeOutcome::Completed { checkpoint } => {
            println!(
                "completed: {agent_id} finished at iteration {}",
                checkpoint.iteration
            );
            Ok(exit_codes::OK)
        }
        ResumeOutcome::NotFound => {
            println!("not_found: no checkpoint for {agent_id}");
            Ok(exit_codes::NOT_FOUND)
        }
    }
}

/// Token cancelled on SIGINT, SIGTERM or SIGHUP.
///
/// Running agents are then stopped through the usual terminate-then-kill path and
/// the context is torn down before the process exits.
fn interrupt_token() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if !handler_token.is_cancelled() {
            warn!("interrupted, stopping running agents");
        }
        handler_token.cancel();
    })
    .context("install interrupt handler")?;
    Ok(cancel)
}

/// Serialize `value` to pretty-printed JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
