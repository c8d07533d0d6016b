//! Process manager for agent child processes.
//!
//! Every spawned process gets its own process group, a registry entry keyed by pid,
//! and a supervisor thread that owns the `Child`. Output arrives on a typed event
//! channel per process: data events first, then exactly one terminal event. The
//! registry entry is removed only after the supervisor observes the exit, never on
//! a kill request alone.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::core::budget::{deadline_after, next_tick, remaining_budget};
use crate::io::write_atomic;

const WAIT_POLL: Duration = Duration::from_millis(50);
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8192;

/// What to run and how.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Scheduling niceness, applied through `nice -n`.
    pub nice: Option<i32>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
    /// Session that owns the process; defaults to this process.
    pub owner_pid: Option<u32>,
    pub task_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Registry entry for a live process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub owner_pid: u32,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Kernel start time in clock ticks since boot; tells a reused pid apart.
    #[serde(default)]
    pub start_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// Per-process event. `Exit` and `WaitFailed` are terminal and arrive last.
#[derive(Debug)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    StreamError { stream: Stream, message: String },
    Exit(ExitStatus),
    WaitFailed(String),
}

#[derive(Debug, Error)]
#[error("failed to spawn `{command}`: {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// No such tracked process (already exited or never spawned here).
    NotRunning,
    /// Exited within the grace window after the graceful-stop signal.
    Graceful,
    /// The forceful-kill signal was sent.
    Killed,
}

/// Handle returned by [`ProcessManager::spawn`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    command: String,
    events: Receiver<ProcessEvent>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn events(&self) -> &Receiver<ProcessEvent> {
        &self.events
    }
}

/// Captured child process output.
#[derive(Debug, Default)]
pub struct CommandOutput {
    /// `None` if no exit was observed.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stream_errors: Vec<String>,
}

impl CommandOutput {
    /// Exit code, with `128 + signal` for signal deaths.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.map(|status| exit_code_of(&status))
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

pub fn exit_code_of(status: &ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Bounds for [`ProcessManager::wait_with_output`].
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions<'a> {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelToken>,
}

enum Control {
    Terminate,
    Kill,
}

struct Tracked {
    record: ProcessRecord,
    control: Sender<Control>,
}

struct Registry {
    tracked: Mutex<HashMap<u32, Tracked>>,
    exited: Condvar,
    ledger_path: Option<PathBuf>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, tracked: Tracked) {
        let mut map = self.lock();
        map.insert(tracked.record.pid, tracked);
        self.persist(&map);
    }

    fn remove(&self, pid: u32) {
        let mut map = self.lock();
        map.remove(&pid);
        self.persist(&map);
        drop(map);
        self.exited.notify_all();
    }

    fn control(&self, pid: u32) -> Option<Sender<Control>> {
        self.lock().get(&pid).map(|t| t.control.clone())
    }

    /// Block until `pid` leaves the registry; false on timeout.
    fn wait_gone(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut map = self.lock();
        while map.contains_key(&pid) {
            let left = remaining_budget(deadline);
            if left.is_zero() {
                return false;
            }
            map = self
                .exited
                .wait_timeout(map, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn persist(&self, map: &HashMap<u32, Tracked>) {
        let Some(path) = &self.ledger_path else {
            return;
        };
        let mut records: Vec<&ProcessRecord> = map.values().map(|t| &t.record).collect();
        records.sort_by_key(|r| r.pid);
        let result = serde_json::to_vec_pretty(&records)
            .context("serialize process ledger")
            .and_then(|buf| write_atomic(path, &buf));
        if let Err(err) = result {
            warn!(path = %path.display(), err = %format!("{err:#}"), "failed to write process ledger");
        }
    }
}

/// Spawns, tracks and reclaims agent processes.
pub struct ProcessManager {
    registry: Arc<Registry>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Mirror the registry into `<dir>/<session pid>.json` so a later session can
    /// reclaim processes left behind by a crash.
    pub fn with_ledger_dir(dir: &Path) -> Self {
        Self::build(Some(dir.join(format!("{}.json", std::process::id()))))
    }

    fn build(ledger_path: Option<PathBuf>) -> Self {
        Self {
            registry: Arc::new(Registry {
                tracked: Mutex::new(HashMap::new()),
                exited: Condvar::new(),
                ledger_path,
            }),
        }
    }

    /// Spawn `request` and start streaming its output.
    ///
    /// Spawn failures surface immediately and leave no registry entry.
    #[instrument(skip_all, fields(program = %request.program, nice = ?request.nice))]
    pub fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, SpawnError> {
        let command_line = request.command_line();
        let spawn_error = |source| {
            error!(command = %command_line, err = %source, "failed to spawn command");
            SpawnError {
                command: command_line.clone(),
                source,
            }
        };

        let mut cmd = build_command(request).map_err(spawn_error)?;
        cmd.stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id();
        let (events_tx, events_rx) = mpsc::channel();
        let (control_tx, control_rx) = mpsc::channel();

        self.registry.insert(Tracked {
            record: ProcessRecord {
                pid,
                command: command_line.clone(),
                started_at: Utc::now(),
                owner_pid: request.owner_pid.unwrap_or_else(std::process::id),
                task_id: request.task_id.clone(),
                start_ticks: process_start_ticks(pid),
            },
            control: control_tx,
        });
        debug!(pid, command = %command_line, "process spawned");

        if let (Some(input), Some(stdin)) = (request.stdin.clone(), child.stdin.take()) {
            spawn_stdin_writer(stdin, input, events_tx.clone());
        }

        let (done_tx, done_rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, events_tx.clone(), done_tx.clone());
            readers.push(Stream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, events_tx.clone(), done_tx.clone());
            readers.push(Stream::Stderr);
        }
        drop(done_tx);

        let registry = Arc::clone(&self.registry);
        thread::spawn(move || {
            supervise(child, control_rx, done_rx, readers, events_tx, registry);
        });

        Ok(ProcessHandle {
            pid,
            command: command_line,
            events: events_rx,
        })
    }

    /// Graceful stop, then forceful kill if the process outlives `grace`.
    ///
    /// Blocks until the exit is observed (or the kill confirmation times out).
    #[instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    pub fn terminate(&self, pid: u32, grace: Duration) -> TerminateOutcome {
        let Some(control) = self.registry.control(pid) else {
            return TerminateOutcome::NotRunning;
        };
        debug!(pid, "sending graceful stop");
        let _ = control.send(Control::Terminate);
        if self.registry.wait_gone(pid, grace) {
            info!(pid, "process exited after graceful stop");
            return TerminateOutcome::Graceful;
        }
        warn!(pid, "grace window elapsed, sending forceful kill");
        let _ = control.send(Control::Kill);
        if !self.registry.wait_gone(pid, KILL_CONFIRM_TIMEOUT) {
            error!(pid, "process still tracked after forceful kill");
        }
        TerminateOutcome::Killed
    }

    /// Drain a handle's events until exit, enforcing the timeout and cancellation
    /// through [`ProcessManager::terminate`].
    #[instrument(skip_all, fields(pid = handle.pid(), timeout_secs = options.timeout.as_secs()))]
    pub fn wait_with_output(
        &self,
        handle: &ProcessHandle,
        options: &WaitOptions<'_>,
    ) -> CommandOutput {
        let deadline = deadline_after(Instant::now(), options.timeout);
        let limit = options.output_limit_bytes;
        let mut out = CommandOutput::default();
        let mut stop_sent = false;

        loop {
            if !stop_sent {
                let cancelled = options.cancel.is_some_and(CancelToken::is_cancelled);
                let expired = remaining_budget(deadline).is_zero();
                if cancelled || expired {
                    stop_sent = true;
                    out.cancelled = cancelled;
                    out.timed_out = !cancelled;
                    warn!(cancelled, timed_out = out.timed_out, "stopping process");
                    self.terminate(handle.pid, options.kill_grace);
                }
            }
            let wait = if stop_sent {
                KILL_CONFIRM_TIMEOUT
            } else {
                next_tick(deadline, WAIT_POLL)
            };
            match handle.events.recv_timeout(wait) {
                Ok(ProcessEvent::Stdout(data)) => {
                    append_limited(&mut out.stdout, &mut out.stdout_truncated, &data, limit);
                }
                Ok(ProcessEvent::Stderr(data)) => {
                    append_limited(&mut out.stderr, &mut out.stderr_truncated, &data, limit);
                }
                Ok(ProcessEvent::StreamError { stream, message }) => {
                    warn!(?stream, %message, "stream error");
                    out.stream_errors.push(format!("{stream:?}: {message}"));
                }
                Ok(ProcessEvent::Exit(status)) => {
                    out.status = Some(status);
                    break;
                }
                Ok(ProcessEvent::WaitFailed(message)) => {
                    out.stream_errors.push(message);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop_sent {
                        error!("no exit event after kill");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if out.stdout_truncated > 0 || out.stderr_truncated > 0 {
            warn!(
                stdout_truncated = out.stdout_truncated,
                stderr_truncated = out.stderr_truncated,
                "output truncated"
            );
        }
        debug!(exit_code = ?out.exit_code(), timed_out = out.timed_out, "command finished");
        out
    }

    /// Terminate every tracked process: one graceful stop to all, then forceful kill
    /// for those still alive after `grace`. Returns how many were signalled.
    #[instrument(skip(self))]
    pub fn cleanup(&self, grace: Duration) -> usize {
        let controls: Vec<(u32, Sender<Control>)> = self
            .registry
            .lock()
            .iter()
            .map(|(pid, t)| (*pid, t.control.clone()))
            .collect();
        if controls.is_empty() {
            self.remove_ledger();
            return 0;
        }
        info!(count = controls.len(), "terminating tracked processes");
        for (_, control) in &controls {
            let _ = control.send(Control::Terminate);
        }
        let deadline = deadline_after(Instant::now(), grace);
        for (pid, control) in &controls {
            if !self.registry.wait_gone(*pid, remaining_budget(deadline)) {
                warn!(pid, "grace window elapsed, sending forceful kill");
                let _ = control.send(Control::Kill);
            }
        }
        for (pid, _) in &controls {
            if !self.registry.wait_gone(*pid, KILL_CONFIRM_TIMEOUT) {
                error!(pid, "process still tracked after cleanup");
            }
        }
        if self.registry.lock().is_empty() {
            self.remove_ledger();
        }
        controls.len()
    }

    /// Tracked processes whose owning session is no longer alive.
    pub fn find_orphans(&self) -> Vec<ProcessRecord> {
        self.tracked()
            .into_iter()
            .filter(|record| !is_alive(record.owner_pid))
            .collect()
    }

    /// Terminate every orphan. Returns the reclaimed records.
    pub fn reap_orphans(&self, grace: Duration) -> Vec<ProcessRecord> {
        let orphans = self.find_orphans();
        for record in &orphans {
            warn!(
                pid = record.pid,
                owner_pid = record.owner_pid,
                command = %record.command,
                "reclaiming orphan process"
            );
            self.terminate(record.pid, grace);
        }
        orphans
    }

    /// Snapshot of the registry, ordered by pid.
    pub fn tracked(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self
            .registry
            .lock()
            .values()
            .map(|t| t.record.clone())
            .collect();
        records.sort_by_key(|r| r.pid);
        records
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.registry.lock().contains_key(&pid)
    }

    fn remove_ledger(&self) {
        if let Some(path) = &self.registry.ledger_path
            && path.exists()
            && let Err(err) = fs::remove_file(path)
        {
            warn!(path = %path.display(), err = %err, "failed to remove process ledger");
        }
    }
}

/// Reclaim processes recorded in ledgers left by sessions that are no longer alive.
///
/// Live ledgers (owner session running) are left untouched. Returns the records of
/// processes that were still running and got terminated.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn reclaim_ledger_orphans(dir: &Path, grace: Duration) -> Result<Vec<ProcessRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let own = format!("{}.json", std::process::id());
    let mut reclaimed = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter(|path| path.file_name().is_some_and(|name| name != own.as_str()))
        .collect();
    entries.sort();

    for path in entries {
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let records: Vec<ProcessRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        let (orphans, live): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|record| !is_alive(record.owner_pid));

        for record in orphans {
            if !is_alive(record.pid) {
                continue;
            }
            if !is_recorded_process(&record) {
                warn!(
                    pid = record.pid,
                    command = %record.command,
                    "ledger pid now names another process, leaving it alone"
                );
                continue;
            }
            warn!(
                pid = record.pid,
                owner_pid = record.owner_pid,
                command = %record.command,
                "reclaiming orphan from ledger"
            );
            signal_group(record.pid, Signal::SIGTERM);
            if !wait_dead(record.pid, grace) {
                signal_group(record.pid, Signal::SIGKILL);
                wait_dead(record.pid, KILL_CONFIRM_TIMEOUT);
            }
            reclaimed.push(record);
        }

        if live.is_empty() {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        } else {
            let buf = serde_json::to_vec_pretty(&live).context("serialize process ledger")?;
            write_atomic(&path, &buf)?;
        }
    }
    Ok(reclaimed)
}

/// True if `pid` names an existing process (zombies included).
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(signal::kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

fn wait_dead(pid: u32, timeout: Duration) -> bool {
    let deadline = deadline_after(Instant::now(), timeout);
    while is_alive(pid) {
        if remaining_budget(deadline).is_zero() {
            return false;
        }
        thread::sleep(next_tick(deadline, WAIT_POLL));
    }
    true
}

/// True if `record.pid` still leads its own process group and, when the start time
/// was recorded, started at the same tick.
fn is_recorded_process(record: &ProcessRecord) -> bool {
    let Ok(raw) = i32::try_from(record.pid) else {
        return false;
    };
    let pid = Pid::from_raw(raw);
    if !matches!(unistd::getpgid(Some(pid)), Ok(group) if group == pid) {
        return false;
    }
    match record.start_ticks {
        Some(ticks) => process_start_ticks(record.pid) == Some(ticks),
        None => true,
    }
}

/// Field 22 of `/proc/<pid>/stat`; `None` where procfs is unavailable.
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parens; fields resume after the last ')'.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Signal the process group led by `pid`. Every spawned agent leads its own group.
fn signal_group(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = signal::killpg(Pid::from_raw(raw), sig) {
        debug!(pid, ?sig, %err, "signal not delivered");
    }
}

fn build_command(request: &SpawnRequest) -> std::io::Result<Command> {
    let mut cmd = match request.nice {
        Some(nice) => {
            // `nice` would report a missing binary as exit 127; fail at spawn instead.
            resolve_program(&request.program, request.workdir.as_deref())?;
            let mut cmd = Command::new("nice");
            cmd.arg("-n").arg(nice.to_string()).arg(&request.program);
            cmd
        }
        None => Command::new(&request.program),
    };
    cmd.args(&request.args).envs(&request.env);
    if let Some(dir) = &request.workdir {
        cmd.current_dir(dir);
    }
    Ok(cmd)
}

fn resolve_program(program: &str, workdir: Option<&Path>) -> std::io::Result<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        let full = match workdir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        };
        return if full.is_file() {
            Ok(full)
        } else {
            Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} not found", full.display()),
            ))
        };
    }
    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            std::io::Error::new(ErrorKind::NotFound, format!("{program} not found on PATH"))
        })
}

fn spawn_stdin_writer(
    mut stdin: std::process::ChildStdin,
    input: Vec<u8>,
    events: Sender<ProcessEvent>,
) {
    thread::spawn(move || {
        // Dropping `stdin` at the end closes the pipe.
        if let Err(err) = stdin.write_all(&input)
            && err.kind() != ErrorKind::BrokenPipe
        {
            let _ = events.send(ProcessEvent::StreamError {
                stream: Stream::Stdin,
                message: err.to_string(),
            });
        }
    });
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    stream: Stream,
    events: Sender<ProcessEvent>,
    done: Sender<Stream>,
) {
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK];
        // Keep draining after the receiver is gone so the child never blocks on a full pipe.
        let mut forwarding = true;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) if forwarding => {
                    let data = chunk[..n].to_vec();
                    let event = match stream {
                        Stream::Stderr => ProcessEvent::Stderr(data),
                        _ => ProcessEvent::Stdout(data),
                    };
                    forwarding = events.send(event).is_ok();
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    let _ = events.send(ProcessEvent::StreamError {
                        stream,
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
        let _ = done.send(stream);
    });
}

fn supervise(
    mut child: Child,
    control: Receiver<Control>,
    done: Receiver<Stream>,
    mut open: Vec<Stream>,
    events: Sender<ProcessEvent>,
    registry: Arc<Registry>,
) {
    let pid = child.id();
    let terminal = loop {
        match child.wait_timeout(WAIT_POLL) {
            Ok(Some(status)) => break ProcessEvent::Exit(status),
            Ok(None) => {}
            Err(err) => {
                error!(pid, err = %err, "wait failed, killing");
                let _ = child.kill();
                break match child.wait() {
                    Ok(status) => ProcessEvent::Exit(status),
                    Err(err) => ProcessEvent::WaitFailed(format!("wait for pid {pid}: {err}")),
                };
            }
        }
        while let Ok(request) = control.try_recv() {
            let sig = match request {
                Control::Terminate => Signal::SIGTERM,
                Control::Kill => Signal::SIGKILL,
            };
            debug!(pid, ?sig, "signalling process group");
            signal_group(pid, sig);
        }
    };

    // Data events precede the terminal event. A descendant that escaped the group can
    // hold the pipes open, so the drain is bounded.
    let deadline = deadline_after(Instant::now(), STREAM_DRAIN_TIMEOUT);
    while !open.is_empty() {
        match done.recv_timeout(remaining_budget(deadline)) {
            Ok(closed) => open.retain(|stream| *stream != closed),
            Err(_) => {
                for stream in open.drain(..) {
                    warn!(pid, ?stream, "stream still open after exit");
                    let _ = events.send(ProcessEvent::StreamError {
                        stream,
                        message: "still open after exit".to_string(),
                    });
                }
            }
        }
    }

    registry.remove(pid);
    let _ = events.send(terminal);
}

fn append_limited(buf: &mut Vec<u8>, truncated: &mut usize, data: &[u8], limit: usize) {
    let remaining = limit.saturating_sub(buf.len());
    let keep = data.len().min(remaining);
    buf.extend_from_slice(&data[..keep]);
    *truncated += data.len() - keep;
}

/// Background sweep that reaps orphans from a shared [`ProcessManager`].
///
/// Stopping wakes the thread immediately; drop stops and joins it.
pub struct OrphanWatcher {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OrphanWatcher {
    pub fn start(manager: Arc<ProcessManager>, interval: Duration, grace: Duration) -> Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("orphan-watcher".to_string())
            .spawn(move || {
                let (flag, wake) = &*signal;
                let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
                while !*stopped {
                    stopped = wake
                        .wait_timeout(stopped, interval)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    let reaped = manager.reap_orphans(grace);
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "orphan sweep reclaimed processes");
                    }
                    stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
                }
                debug!("orphan watcher stopped");
            })
            .context("spawn orphan watcher thread")?;
        debug!(interval_secs = interval.as_secs(), "orphan watcher started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        let (flag, wake) = &*self.stop;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("orphan watcher panicked");
        }
    }
}

impl Drop for OrphanWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SpawnRequest {
        SpawnRequest::new("sh").arg("-c").arg(script)
    }

    fn wait(manager: &ProcessManager, handle: &ProcessHandle, timeout: Duration) -> CommandOutput {
        manager.wait_with_output(
            handle,
            &WaitOptions {
                timeout,
                kill_grace: Duration::from_millis(200),
                output_limit_bytes: 1000,
                cancel: None,
            },
        )
    }

    fn wait_for_stdout(handle: &ProcessHandle, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains(needle) {
            match handle.events().recv_timeout(remaining_budget(deadline)) {
                Ok(ProcessEvent::Stdout(data)) => seen.extend(data),
                Ok(_) => {}
                Err(err) => panic!("no '{needle}' on stdout: {err}"),
            }
        }
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait true");
        pid
    }

    #[test]
    fn spawn_missing_binary_fails_without_registry_entry() {
        let manager = ProcessManager::new();
        let err = manager
            .spawn(&SpawnRequest::new("definitely-not-a-real-binary-xyz"))
            .unwrap_err();
        assert_eq!(err.source.kind(), ErrorKind::NotFound);
        assert!(manager.tracked().is_empty());
    }

    #[test]
    fn missing_binary_fails_at_spawn_even_with_nice() {
        let manager = ProcessManager::new();
        let request = SpawnRequest {
            nice: Some(5),
            ..SpawnRequest::new("definitely-not-a-real-binary-xyz")
        };
        assert!(manager.spawn(&request).is_err());
    }

    #[test]
    fn captures_output_and_exit_code() {
        let manager = ProcessManager::new();
        let handle = manager
            .spawn(&sh("echo out; echo err >&2; exit 3"))
            .expect("spawn");
        let out = wait(&manager, &handle, Duration::from_secs(10));
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.stderr_text(), "err\n");
        assert_eq!(out.exit_code(), Some(3));
        assert!(!out.timed_out);
        assert!(!manager.is_tracked(handle.pid()));
    }

    #[test]
    fn reports_the_stream_left_open_after_exit() {
        let manager = ProcessManager::new();
        // The background sleep keeps only stderr open past the shell's exit.
        let handle = manager
            .spawn(&sh("sleep 4 >/dev/null & echo out"))
            .expect("spawn");
        let out = wait(&manager, &handle, Duration::from_secs(10));
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.exit_code(), Some(0));
        assert_eq!(out.stream_errors, vec!["Stderr: still open after exit".to_string()]);
    }

    #[test]
    fn forwards_stdin_env_and_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = ProcessManager::new();
        let mut request = sh("cat; printf ' %s ' \"$GREETING\"; pwd");
        request.stdin = Some(b"hello".to_vec());
        request.env.insert("GREETING".to_string(), "hi".to_string());
        request.workdir = Some(temp.path().to_path_buf());
        request.nice = Some(10);
        let handle = manager.spawn(&request).expect("spawn");
        let out = wait(&manager, &handle, Duration::from_secs(10));
        let text = out.stdout_text();
        assert!(text.starts_with("hello hi "), "got {text:?}");
        let dir_name = temp.path().file_name().expect("name").to_string_lossy().to_string();
        assert!(text.contains(&dir_name));
    }

    #[test]
    fn output_beyond_limit_is_counted_as_truncated() {
        let manager = ProcessManager::new();
        let handle = manager
            .spawn(&sh("head -c 5000 /dev/zero"))
            .expect("spawn");
        let out = wait(&manager, &handle, Duration::from_secs(10));
        assert_eq!(out.stdout.len(), 1000);
        assert_eq!(out.stdout_truncated, 4000);
        assert!(out.stdout_truncated_notice("agent").contains("4000"));
    }

    #[test]
    fn timeout_kills_process() {
        let manager = ProcessManager::new();
        let handle = manager.spawn(&sh("sleep 30")).expect("spawn");
        let started = Instant::now();
        let out = wait(&manager, &handle, Duration::from_millis(200));
        assert!(out.timed_out);
        assert!(out.status.is_some());
        assert_ne!(out.exit_code(), Some(0));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!manager.is_tracked(handle.pid()));
    }

    #[test]
    fn cancellation_stops_process() {
        let manager = ProcessManager::new();
        let handle = manager.spawn(&sh("sleep 30")).expect("spawn");
        let token = CancelToken::new();
        token.cancel();
        let out = manager.wait_with_output(
            &handle,
            &WaitOptions {
                timeout: Duration::from_secs(30),
                kill_grace: Duration::from_millis(200),
                output_limit_bytes: 100,
                cancel: Some(&token),
            },
        );
        assert!(out.cancelled);
        assert!(!out.timed_out);
    }

    #[test]
    fn terminate_is_graceful_when_process_honors_sigterm() {
        let manager = ProcessManager::new();
        let handle = manager.spawn(&sh("echo ready; sleep 30")).expect("spawn");
        wait_for_stdout(&handle, "ready");
        let outcome = manager.terminate(handle.pid(), Duration::from_secs(5));
        assert_eq!(outcome, TerminateOutcome::Graceful);
        assert!(!manager.is_tracked(handle.pid()));
    }

    #[test]
    fn terminate_escalates_to_kill_when_sigterm_is_ignored() {
        let manager = ProcessManager::new();
        let handle = manager
            .spawn(&sh("trap '' TERM; echo ready; sleep 30"))
            .expect("spawn");
        wait_for_stdout(&handle, "ready");
        let outcome = manager.terminate(handle.pid(), Duration::from_millis(300));
        assert_eq!(outcome, TerminateOutcome::Killed);
        assert!(!manager.is_tracked(handle.pid()));

        let exit = std::iter::from_fn(|| handle.events().recv_timeout(Duration::from_secs(5)).ok())
            .find_map(|event| match event {
                ProcessEvent::Exit(status) => Some(status),
                _ => None,
            })
            .expect("exit event");
        assert_eq!(exit.signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn terminate_unknown_pid_is_not_running() {
        let manager = ProcessManager::new();
        assert_eq!(
            manager.terminate(dead_pid(), Duration::from_millis(10)),
            TerminateOutcome::NotRunning
        );
    }

    #[test]
    fn orphans_are_detected_and_reaped() {
        let manager = ProcessManager::new();
        let orphan = SpawnRequest {
            owner_pid: Some(dead_pid()),
            task_id: Some("t1".to_string()),
            ..sh("sleep 30")
        };
        let owned = manager.spawn(&sh("sleep 30")).expect("spawn owned");
        let handle = manager.spawn(&orphan).expect("spawn orphan");

        let orphans = manager.find_orphans();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].pid, handle.pid());
        assert_eq!(orphans[0].task_id.as_deref(), Some("t1"));

        let reaped = manager.reap_orphans(Duration::from_secs(2));
        assert_eq!(reaped.len(), 1);
        assert!(!manager.is_tracked(handle.pid()));
        assert!(manager.is_tracked(owned.pid()));

        assert_eq!(manager.cleanup(Duration::from_secs(2)), 1);
        assert!(manager.tracked().is_empty());
    }

    #[test]
    fn ledger_mirrors_registry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = ProcessManager::with_ledger_dir(temp.path());
        let ledger = temp.path().join(format!("{}.json", std::process::id()));

        let handle = manager.spawn(&sh("sleep 30")).expect("spawn");
        let records: Vec<ProcessRecord> =
            serde_json::from_str(&fs::read_to_string(&ledger).expect("read")).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, handle.pid());

        manager.cleanup(Duration::from_secs(2));
        assert!(!ledger.exists());
    }

    #[test]
    fn reclaims_processes_from_dead_session_ledger() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        // Reap as soon as it dies so liveness checks do not see a zombie.
        let reaper = thread::spawn(move || child.wait());

        let owner = dead_pid();
        let record = ProcessRecord {
            pid,
            command: "sleep 30".to_string(),
            started_at: Utc::now(),
            owner_pid: owner,
            task_id: None,
            start_ticks: process_start_ticks(pid),
        };
        let ledger = temp.path().join(format!("{owner}.json"));
        fs::write(&ledger, serde_json::to_vec(&vec![record]).expect("json")).expect("write");

        let reclaimed =
            reclaim_ledger_orphans(temp.path(), Duration::from_secs(2)).expect("reclaim");
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].pid, pid);
        assert!(!ledger.exists());
        let status = reaper.join().expect("join").expect("wait");
        assert!(!status.success());
    }

    /// Write a dead-owner ledger for `record` and reclaim it; returns what was reclaimed.
    fn reclaim_single(dir: &Path, record: ProcessRecord) -> Vec<ProcessRecord> {
        let ledger = dir.join(format!("{}.json", record.owner_pid));
        fs::write(&ledger, serde_json::to_vec(&vec![record]).expect("json")).expect("write");
        let reclaimed = reclaim_ledger_orphans(dir, Duration::from_millis(200)).expect("reclaim");
        assert!(!ledger.exists());
        reclaimed
    }

    #[test]
    fn ledger_pid_that_is_not_a_group_leader_is_left_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Same process group as the test binary, like an unrelated process reusing the pid.
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();
        let record = ProcessRecord {
            pid,
            command: "agent".to_string(),
            started_at: Utc::now(),
            owner_pid: dead_pid(),
            task_id: None,
            start_ticks: None,
        };

        let reclaimed = reclaim_single(temp.path(), record);
        assert!(reclaimed.is_empty());
        assert!(child.try_wait().expect("try_wait").is_none());
        child.kill().expect("kill");
        child.wait().expect("wait");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn ledger_pid_with_another_start_time_is_left_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let pid = child.id();
        let ticks = process_start_ticks(pid).expect("start ticks");
        let record = ProcessRecord {
            pid,
            command: "agent".to_string(),
            started_at: Utc::now(),
            owner_pid: dead_pid(),
            task_id: None,
            start_ticks: Some(ticks + 1),
        };

        let reclaimed = reclaim_single(temp.path(), record);
        assert!(reclaimed.is_empty());
        assert!(child.try_wait().expect("try_wait").is_none());
        child.kill().expect("kill");
        child.wait().expect("wait");
    }

    #[test]
    fn watcher_reaps_orphans_and_stops_promptly() {
        let manager = Arc::new(ProcessManager::new());
        let orphan = SpawnRequest {
            owner_pid: Some(dead_pid()),
            ..sh("sleep 30")
        };
        let handle = manager.spawn(&orphan).expect("spawn");
        let mut watcher = OrphanWatcher::start(
            Arc::clone(&manager),
            Duration::from_millis(50),
            Duration::from_millis(500),
        )
        .expect("start");

        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.is_tracked(handle.pid()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!manager.is_tracked(handle.pid()));

        let stopping = Instant::now();
        watcher.stop();
        assert!(stopping.elapsed() < Duration::from_secs(2));
    }
}
