//! Attempt orchestration.
//!
//! One attempt walks `idle → admitting → breaker-check → spawning → running →
//! parsing → recording → idle`, or ends in `aborted` when it is rejected, fails to
//! spawn, or is cancelled before it starts. The concurrency slot is held by a
//! guard, so every exit path releases it; breaker and checkpoint updates happen
//! only after the process exit was observed. Breakers and model rotation are both
//! kept per key.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::breaker::{CircuitBreakers, CircuitOpenError};
use crate::cancel::CancelToken;
use crate::concurrency::{ConcurrencyManager, ConcurrencyRejected, ConcurrencySettings};
use crate::core::breaker::Admission;
use crate::core::key::{DEFAULT_KEY, SlotKey};
use crate::core::selector::ModelRotation;
use crate::core::types::{AgentCheckpoint, CheckpointPhase, ParsedResult, ResultStatus, Task};
use crate::io::agent::{spawn_request, write_attempt_log};
use crate::io::checkpoint::CheckpointStore;
use crate::io::config::LoopConfig;
use crate::io::git::Git;
use crate::io::process::{
    CommandOutput, OrphanWatcher, ProcessManager, SpawnError, WaitOptions, reclaim_ledger_orphans,
};
use crate::parse::{ParseInput, ResultParser};

/// Why an attempt did not produce a normal report.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The agent binary could not be started. Counted as a breaker failure.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The attempt ran past its budget and was killed. Counted as a failure.
    #[error("attempt timed out after {}s", .timeout.as_secs())]
    Timeout {
        timeout: Duration,
        report: Box<AttemptReport>,
    },
    /// Rejected by the key's circuit; nothing was started.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    /// No concurrency slot; nothing was started.
    #[error(transparent)]
    ConcurrencyRejected(#[from] ConcurrencyRejected),
    /// Withdrawn before start (`report` is `None`) or stopped while running.
    #[error("attempt cancelled")]
    Cancelled { report: Option<Box<AttemptReport>> },
    #[error("{0:#}")]
    Io(anyhow::Error),
}

impl ExecError {
    /// True when no process was spawned and no breaker state changed.
    pub fn never_started(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen(_) | Self::ConcurrencyRejected(_) | Self::Cancelled { report: None }
        )
    }

    pub fn report(&self) -> Option<&AttemptReport> {
        match self {
            Self::Timeout { report, .. } => Some(report),
            Self::Cancelled { report } => report.as_deref(),
            _ => None,
        }
    }
}

/// One finished attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub attempt_id: u64,
    pub key: String,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub iteration: u32,
    pub model: Option<String>,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Observed exit code (`128 + signal` for signal deaths).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub result: ParsedResult,
}

impl AttemptReport {
    /// Ran to completion with a `success` or `partial` result.
    pub fn made_progress(&self) -> bool {
        !self.timed_out && !self.cancelled && self.result.status.is_progress()
    }
}

/// Per-attempt knobs. Everything is optional.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Partition key (`namespace` or `namespace/kind`); defaults to `default`.
    pub key: Option<String>,
    /// Checkpoint owner; no checkpoint is written without one.
    pub agent_id: Option<String>,
    /// Iteration to record; defaults to the restored iteration plus one.
    pub iteration: Option<u32>,
    /// Overrides the model rotation.
    pub model: Option<String>,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub nice: Option<i32>,
    pub base_ref: Option<String>,
    pub cancel: Option<CancelToken>,
    /// Opaque checkpoint payload; defaults to a summary of the attempt.
    pub checkpoint_state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Admitting,
    BreakerCheck,
    Spawning,
    Running,
    Parsing,
    Recording,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Admitting => "admitting",
            Self::BreakerCheck => "breaker-check",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Parsing => "parsing",
            Self::Recording => "recording",
            Self::Aborted => "aborted",
        })
    }
}

/// Every component an attempt needs, built once per session.
pub struct ExecutionContext {
    root: PathBuf,
    config: LoopConfig,
    processes: Arc<ProcessManager>,
    concurrency: ConcurrencyManager,
    breakers: CircuitBreakers,
    checkpoints: CheckpointStore,
    /// Model rotation per key, created on first use.
    rotations: Mutex<HashMap<String, ModelRotation>>,
    parser: ResultParser,
    watcher: Mutex<Option<OrphanWatcher>>,
}

impl ExecutionContext {
    /// Build the context for a project root.
    ///
    /// Processes left by crashed sessions (per the ledger directory) are reclaimed
    /// before anything new is spawned.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn init(config: LoopConfig, root: &Path) -> Result<Self> {
        config.validate()?;
        let ledger_dir = ledger_dir(root);
        match reclaim_ledger_orphans(&ledger_dir, config.agent.kill_grace()) {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "reclaimed processes from a previous session");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "failed to reclaim ledger orphans"),
        }

        let processes = Arc::new(ProcessManager::with_ledger_dir(&ledger_dir));
        let git = Git::new(root);
        let parser = if git.is_repo() {
            ResultParser::with_vcs(git)
        } else {
            debug!("not a git work tree, artifacts disabled");
            ResultParser::text_only()
        };
        let watcher = match config.orphans.check_interval_secs {
            0 => None,
            secs => Some(OrphanWatcher::start(
                Arc::clone(&processes),
                Duration::from_secs(secs),
                config.agent.kill_grace(),
            )?),
        };

        Ok(Self {
            root: root.to_path_buf(),
            concurrency: ConcurrencyManager::new(ConcurrencySettings::from(&config.concurrency)),
            breakers: CircuitBreakers::new(config.breaker.settings()),
            checkpoints: CheckpointStore::new(config.checkpoint_dir(root)),
            rotations: Mutex::new(HashMap::new()),
            processes,
            parser,
            watcher: Mutex::new(watcher),
            config,
        })
    }

    /// Replace the result parser (e.g. with a scripted collaborator).
    pub fn with_parser(mut self, parser: ResultParser) -> Self {
        self.parser = parser;
        self
    }

    /// Stop the orphan watcher and terminate every tracked process.
    pub fn teardown(&self) {
        if let Some(mut watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.stop();
        }
        let count = self.processes.cleanup(self.config.agent.kill_grace());
        debug!(count, "context torn down");
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Model the next attempt under `key` will use.
    pub fn active_model(&self, key: &str) -> Option<String> {
        self.with_rotation(key, |rotation| rotation.active().map(|m| m.name.clone()))
    }

    fn with_rotation<T>(&self, key: &str, f: impl FnOnce(&mut ModelRotation) -> T) -> T {
        let mut rotations = self.rotations.lock().unwrap_or_else(PoisonError::into_inner);
        let rotation = rotations.entry(key.to_string()).or_insert_with(|| {
            ModelRotation::new(
                self.config.models.clone(),
                self.config.selector.fallback_after_failures,
            )
        });
        f(rotation)
    }
}

pub fn ledger_dir(root: &Path) -> PathBuf {
    root.join(".agentloop").join("processes")
}

/// Runs attempts against a shared [`ExecutionContext`].
pub struct AgentExecutor<'a> {
    ctx: &'a ExecutionContext,
    running: Mutex<HashMap<u64, CancelToken>>,
    next_attempt: AtomicU64,
}

impl<'a> AgentExecutor<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self {
            ctx,
            running: Mutex::new(HashMap::new()),
            next_attempt: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        self.ctx
    }

    /// Run one attempt of `prompt`, writing the attempt log to `output_file`.
    pub fn execute(
        &self,
        prompt: &str,
        output_file: Option<&Path>,
        timeout: Option<Duration>,
        options: &ExecOptions,
    ) -> Result<AttemptReport, ExecError> {
        self.run_attempt(prompt, output_file, timeout, options, None)
    }

    /// Run one attempt for `task`. The task's namespace and id fill in the key and
    /// checkpoint owner when the options leave them unset.
    pub fn execute_task(
        &self,
        task: &Task,
        prompt: &str,
        output_file: Option<&Path>,
        timeout: Option<Duration>,
        options: &ExecOptions,
    ) -> Result<AttemptReport, ExecError> {
        let mut options = options.clone();
        if options.key.is_none() {
            options.key.clone_from(&task.namespace);
        }
        if options.agent_id.is_none() {
            options.agent_id = Some(task.id.clone());
        }
        self.run_attempt(prompt, output_file, timeout, &options, Some(task.id.clone()))
    }

    /// Cancel every attempt currently running or queued on this executor.
    /// Running processes go through the graceful-then-forceful kill.
    pub fn kill_current(&self) -> usize {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        for token in running.values() {
            token.cancel();
        }
        if !running.is_empty() {
            info!(count = running.len(), "cancelling running attempts");
        }
        running.len()
    }

    /// Cancel running attempts and terminate every tracked process.
    pub fn cleanup(&self) {
        self.kill_current();
        self.ctx.processes.cleanup(self.ctx.config.agent.kill_grace());
    }

    #[instrument(skip_all, fields(attempt = tracing::field::Empty, key = tracing::field::Empty))]
    fn run_attempt(
        &self,
        prompt: &str,
        output_file: Option<&Path>,
        timeout: Option<Duration>,
        options: &ExecOptions,
        task_id: Option<String>,
    ) -> Result<AttemptReport, ExecError> {
        let ctx = self.ctx;
        let attempt_id = self.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let key = SlotKey::parse(options.key.as_deref().unwrap_or(DEFAULT_KEY));
        let key_name = key.to_string();
        tracing::Span::current()
            .record("attempt", attempt_id)
            .record("key", key_name.as_str());
        let phase = |phase: Phase| debug!(attempt = attempt_id, key = %key_name, %phase, "phase");

        let cancel = options.cancel.clone().unwrap_or_default();
        let _registration = Registration::new(&self.running, attempt_id, cancel.clone());

        phase(Phase::Admitting);
        let mut slot = match ctx.concurrency.acquire(&key, Some(&cancel)) {
            Ok(slot) => slot,
            Err(ConcurrencyRejected::Cancelled { .. }) => {
                phase(Phase::Aborted);
                return Err(ExecError::Cancelled { report: None });
            }
            Err(err) => {
                phase(Phase::Aborted);
                return Err(err.into());
            }
        };

        phase(Phase::BreakerCheck);
        let admission = match ctx.breakers.check(&key_name) {
            Ok(admission) => admission,
            Err(err) => {
                phase(Phase::Aborted);
                return Err(err.into());
            }
        };
        let give_back = || {
            if admission == Admission::Trial {
                ctx.breakers.abandon_trial(&key_name);
            }
        };
        if cancel.is_cancelled() {
            give_back();
            phase(Phase::Aborted);
            return Err(ExecError::Cancelled { report: None });
        }

        phase(Phase::Spawning);
        let model = options.model.clone().or_else(|| ctx.active_model(&key_name));
        let iteration = self.next_iteration(options);
        let mut request = match spawn_request(&ctx.config.agent, prompt, model.as_deref()) {
            Ok(request) => request,
            Err(err) => {
                give_back();
                phase(Phase::Aborted);
                return Err(ExecError::Io(err));
            }
        };
        request.workdir = Some(options.workdir.clone().unwrap_or_else(|| ctx.root.clone()));
        request.env.extend(options.env.clone());
        if options.nice.is_some() {
            request.nice = options.nice;
        }
        request.task_id.clone_from(&task_id);

        let started_at = Utc::now();
        let started = Instant::now();
        let handle = match ctx.processes.spawn(&request) {
            Ok(handle) => handle,
            Err(err) => {
                ctx.breakers.record_failure(&key_name);
                self.record_model_outcome(&key_name, false);
                slot.release();
                phase(Phase::Aborted);
                return Err(err.into());
            }
        };

        phase(Phase::Running);
        let timeout = timeout.unwrap_or_else(|| ctx.config.agent.timeout());
        let output = ctx.processes.wait_with_output(
            &handle,
            &WaitOptions {
                timeout,
                kill_grace: ctx.config.agent.kill_grace(),
                output_limit_bytes: ctx.config.agent.output_limit_bytes,
                cancel: Some(&cancel),
            },
        );
        let duration = started.elapsed();
        if let Some(path) = output_file
            && let Err(err) = write_attempt_log(path, &output)
        {
            warn!(path = %path.display(), err = %format!("{err:#}"), "failed to write attempt log");
        }

        phase(Phase::Parsing);
        let raw = combined_output(&output);
        let stopped = output.timed_out || output.cancelled;
        let result = ctx.parser.parse(&ParseInput {
            // A killed attempt has no meaningful exit code.
            exit_code: if stopped { None } else { output.exit_code() },
            output: &raw,
            duration,
            base_ref: options.base_ref.as_deref(),
        });

        phase(Phase::Recording);
        let failed = output.timed_out || result.status == ResultStatus::Failure;
        if output.cancelled {
            give_back();
        } else if failed {
            ctx.breakers.record_failure(&key_name);
            self.record_model_outcome(&key_name, false);
        } else {
            ctx.breakers.record_success(&key_name);
            self.record_model_outcome(&key_name, true);
        }

        let report = AttemptReport {
            attempt_id,
            key: key_name.clone(),
            task_id,
            agent_id: options.agent_id.clone(),
            iteration,
            model,
            pid: handle.pid(),
            started_at,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            result,
        };
        self.save_checkpoint(&report, options);
        slot.release();
        phase(Phase::Idle);

        info!(
            status = ?report.result.status,
            exit_code = ?report.exit_code,
            duration_ms = report.duration_ms,
            model = ?report.model,
            "attempt finished"
        );
        if report.timed_out {
            return Err(ExecError::Timeout {
                timeout,
                report: Box::new(report),
            });
        }
        if report.cancelled {
            return Err(ExecError::Cancelled {
                report: Some(Box::new(report)),
            });
        }
        Ok(report)
    }

    fn next_iteration(&self, options: &ExecOptions) -> u32 {
        if let Some(iteration) = options.iteration {
            return iteration;
        }
        let Some(agent_id) = options.agent_id.as_deref() else {
            return 1;
        };
        match self.ctx.checkpoints.restore(agent_id) {
            Ok(Some(checkpoint)) => checkpoint.iteration.saturating_add(1),
            Ok(None) => 1,
            Err(err) => {
                warn!(agent_id, err = %err, "checkpoint unreadable, starting at iteration 1");
                1
            }
        }
    }

    fn record_model_outcome(&self, key: &str, success: bool) {
        self.ctx.with_rotation(key, |rotation| {
            if success {
                rotation.record_success();
                return;
            }
            let before = rotation.active().map(|m| m.name.clone());
            let after = rotation.record_failure().map(|m| m.name.clone());
            if before != after {
                info!(key, from = ?before, to = ?after, fallback = rotation.selector().is_using_fallback(), "switched model");
            }
        });
    }

    /// Best effort: a failed save is logged and never fails the attempt.
    fn save_checkpoint(&self, report: &AttemptReport, options: &ExecOptions) {
        let Some(agent_id) = report.agent_id.as_deref() else {
            return;
        };
        let phase = if report.cancelled {
            CheckpointPhase::Paused
        } else if report.made_progress() {
            CheckpointPhase::Running
        } else {
            CheckpointPhase::Failed
        };
        let state = options.checkpoint_state.clone().unwrap_or_else(|| {
            json!({
                "task_id": report.task_id,
                "key": report.key,
                "model": report.model,
                "status": report.result.status,
                "summary": report.result.summary,
            })
        });
        let checkpoint = AgentCheckpoint::new(agent_id, phase, report.iteration, state);
        if let Err(err) = self.ctx.checkpoints.save(agent_id, &checkpoint) {
            warn!(agent_id, err = %err, "checkpoint save failed");
        }
    }
}

/// Stdout followed by stderr; agents print counters to either.
fn combined_output(output: &CommandOutput) -> String {
    let mut raw = output.stdout_text();
    let stderr = output.stderr_text();
    if !stderr.is_empty() {
        if !raw.is_empty() && !raw.ends_with('\n') {
            raw.push('\n');
        }
        raw.push_str(&stderr);
    }
    raw
}

/// Keeps an attempt's cancel token visible to `kill_current` while it runs.
struct Registration<'r> {
    running: &'r Mutex<HashMap<u64, CancelToken>>,
    attempt_id: u64,
}

impl<'r> Registration<'r> {
    fn new(running: &'r Mutex<HashMap<u64, CancelToken>>, attempt_id: u64, token: CancelToken) -> Self {
        running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(attempt_id, token);
        Self {
            running,
            attempt_id,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.attempt_id);
    }
}
