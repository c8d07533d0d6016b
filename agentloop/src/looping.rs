//! Task queue loop for `agentloop run`.
//!
//! Tasks are grouped by key and each key gets its own pool of worker threads, one
//! per concurrency slot, so one key whose circuit is open never holds up the
//! others. Within a key, tasks are started in priority order (lower value first).

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::core::followups::normalize_title;
use crate::core::key::{DEFAULT_KEY, SlotKey};
use crate::core::types::{
    AgentCheckpoint, CheckpointPhase, FollowUpTask, ResultStatus, Task, TaskStatus,
};
use crate::executor::{AgentExecutor, AttemptReport, ExecError, ExecOptions};
use crate::resume::{ResumeOutcome, resume};

const CIRCUIT_POLL: Duration = Duration::from_millis(100);

/// Knobs for [`run_loop`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Attempts per task that actually ran (rejections are not counted).
    pub max_attempts: u32,
    /// Total time a task may spend waiting for its key's circuit to close.
    pub max_circuit_wait: Duration,
    /// Per-attempt timeout; the agent config's timeout when `None`.
    pub timeout: Option<Duration>,
    /// Where attempt logs go; no logs when `None`.
    pub log_dir: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_circuit_wait: Duration::from_secs(300),
            timeout: None,
            log_dir: None,
            cancel: CancelToken::new(),
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { attempts: u32, status: ResultStatus },
    /// A `completed` checkpoint already existed.
    AlreadyCompleted,
    /// Task status was already `done` or `blocked`.
    Skipped,
    Exhausted { attempts: u32 },
    /// Never admitted (circuit stayed open, or no concurrency slot).
    Rejected { attempts: u32, reason: String },
    Cancelled { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub key: String,
    pub outcome: TaskOutcome,
    pub follow_ups: Vec<FollowUpTask>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopReport {
    pub tasks: Vec<TaskReport>,
}

impl LoopReport {
    pub fn completed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.outcome,
                    TaskOutcome::Completed { .. } | TaskOutcome::AlreadyCompleted
                )
            })
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.outcome, TaskOutcome::Rejected { .. }))
            .count()
    }

    pub fn cancelled(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| matches!(t.outcome, TaskOutcome::Cancelled { .. }))
            .count()
    }

    /// Tasks that ran but did not complete.
    pub fn failed(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.outcome,
                    TaskOutcome::Exhausted { .. } | TaskOutcome::Failed { .. }
                )
            })
            .count()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

/// Load tasks from a JSON file: either an array or `{"tasks": [...]}`.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: TaskFile =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let tasks = match file {
        TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
    };
    let mut seen = HashSet::new();
    for task in &tasks {
        if task.id.trim().is_empty() {
            return Err(anyhow!("task with empty id in {}", path.display()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(anyhow!("duplicate task id '{}' in {}", task.id, path.display()));
        }
    }
    Ok(tasks)
}

/// Prompt text for a task.
pub fn task_prompt(task: &Task) -> String {
    if task.description.trim().is_empty() {
        task.title.clone()
    } else {
        format!("{}\n\n{}", task.title, task.description)
    }
}

/// Run every task to completion, exhaustion or rejection.
///
/// `on_task` is called from worker threads as each task finishes. Follow-up
/// suggestions are collected in the report, never enqueued.
pub fn run_loop(
    executor: &AgentExecutor<'_>,
    tasks: Vec<Task>,
    settings: &LoopSettings,
    on_task: &(dyn Fn(&TaskReport) + Sync),
) -> Result<LoopReport> {
    let mut groups: BTreeMap<SlotKey, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        let key = SlotKey::parse(task.namespace.as_deref().unwrap_or(DEFAULT_KEY));
        groups.entry(key).or_default().push(task);
    }
    let concurrency = executor.context().concurrency().settings();
    let queues: Vec<KeyQueue> = groups
        .into_iter()
        .map(|(key, mut group)| {
            group.sort_by_key(|task| task.priority);
            let workers = concurrency.capacity_for(&key).clamp(1, group.len());
            KeyQueue {
                key: key.to_string(),
                workers,
                pending: Mutex::new(group.into_iter().enumerate().collect()),
            }
        })
        .collect();
    info!(keys = queues.len(), "starting task loop");

    let results: Vec<(String, thread::Result<Vec<(usize, TaskReport)>>)> =
        thread::scope(|scope| {
            let workers: Vec<_> = queues
                .iter()
                .flat_map(|queue| (0..queue.workers).map(move |_| queue))
                .map(|queue| {
                    let worker = scope.spawn(move || {
                        let mut done = Vec::new();
                        while let Some((index, task)) = queue.next() {
                            let report = run_task(executor, &task, &queue.key, settings);
                            on_task(&report);
                            done.push((index, report));
                        }
                        done
                    });
                    (queue.key.clone(), worker)
                })
                .collect();
            workers
                .into_iter()
                .map(|(key, worker)| (key, worker.join()))
                .collect()
        });

    let mut finished: BTreeMap<String, Vec<(usize, TaskReport)>> = BTreeMap::new();
    for (key, result) in results {
        let tasks = result.map_err(|_| anyhow!("worker for key '{key}' panicked"))?;
        finished.entry(key).or_default().extend(tasks);
    }
    let mut report = LoopReport::default();
    for mut tasks in finished.into_values() {
        tasks.sort_by_key(|(index, _)| *index);
        report.tasks.extend(tasks.into_iter().map(|(_, task)| task));
    }
    info!(
        completed = report.completed(),
        failed = report.failed(),
        rejected = report.rejected(),
        "task loop finished"
    );
    Ok(report)
}

/// Tasks of one key, drained in priority order by `workers` threads.
struct KeyQueue {
    key: String,
    workers: usize,
    pending: Mutex<VecDeque<(usize, Task)>>,
}

impl KeyQueue {
    fn next(&self) -> Option<(usize, Task)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

fn run_task(
    executor: &AgentExecutor<'_>,
    task: &Task,
    key: &str,
    settings: &LoopSettings,
) -> TaskReport {
    let mut follow_ups = FollowUps::default();
    let outcome = attempt_task(executor, task, settings, &mut follow_ups);
    debug!(task_id = %task.id, key, ?outcome, "task finished");
    TaskReport {
        task_id: task.id.clone(),
        key: key.to_string(),
        outcome,
        follow_ups: follow_ups.into_vec(),
    }
}

fn attempt_task(
    executor: &AgentExecutor<'_>,
    task: &Task,
    settings: &LoopSettings,
    follow_ups: &mut FollowUps,
) -> TaskOutcome {
    if matches!(task.status, TaskStatus::Done | TaskStatus::Blocked) {
        return TaskOutcome::Skipped;
    }
    let ctx = executor.context();
    match resume(ctx.checkpoints(), &task.id) {
        ResumeOutcome::Completed { .. } => return TaskOutcome::AlreadyCompleted,
        ResumeOutcome::Resumed { message, .. } => info!(task_id = %task.id, %message),
        ResumeOutcome::NotFound => {}
    }

    let prompt = task_prompt(task);
    let options = ExecOptions {
        cancel: Some(settings.cancel.clone()),
        ..ExecOptions::default()
    };
    let mut attempts = 0u32;
    let mut circuit_waited = Duration::ZERO;

    while attempts < settings.max_attempts {
        if settings.cancel.is_cancelled() {
            return TaskOutcome::Cancelled { attempts };
        }
        let log = settings
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.log", log_stem(&task.id), attempts + 1)));
        match executor.execute_task(task, &prompt, log.as_deref(), settings.timeout, &options) {
            Ok(report) => {
                attempts += 1;
                follow_ups.extend(&report.result.follow_up_tasks);
                if report.made_progress() {
                    mark_completed(executor, &report);
                    return TaskOutcome::Completed {
                        attempts,
                        status: report.result.status,
                    };
                }
                warn!(task_id = %task.id, attempts, summary = %report.result.summary, "attempt failed");
            }
            Err(ExecError::CircuitOpen(err)) => {
                if circuit_waited + err.retry_in > settings.max_circuit_wait {
                    return TaskOutcome::Rejected {
                        attempts,
                        reason: err.to_string(),
                    };
                }
                debug!(task_id = %task.id, retry_ms = err.retry_in.as_millis() as u64, "waiting for circuit");
                circuit_waited += err.retry_in;
                if !sleep_until(err.retry_at, &settings.cancel) {
                    return TaskOutcome::Cancelled { attempts };
                }
            }
            Err(ExecError::ConcurrencyRejected(err)) => {
                return TaskOutcome::Rejected {
                    attempts,
                    reason: err.to_string(),
                };
            }
            Err(ExecError::Cancelled { .. }) => return TaskOutcome::Cancelled { attempts },
            Err(err @ (ExecError::Timeout { .. } | ExecError::Spawn(_))) => {
                attempts += 1;
                if let Some(report) = err.report() {
                    follow_ups.extend(&report.result.follow_up_tasks);
                }
                warn!(task_id = %task.id, attempts, err = %err, "attempt failed");
            }
            Err(ExecError::Io(err)) => {
                return TaskOutcome::Failed {
                    attempts,
                    reason: format!("{err:#}"),
                };
            }
        }
    }
    TaskOutcome::Exhausted { attempts }
}

fn mark_completed(executor: &AgentExecutor<'_>, report: &AttemptReport) {
    let Some(agent_id) = report.agent_id.as_deref() else {
        return;
    };
    let checkpoint = AgentCheckpoint::new(
        agent_id,
        CheckpointPhase::Completed,
        report.iteration,
        json!({
            "task_id": report.task_id,
            "status": report.result.status,
            "summary": report.result.summary,
        }),
    );
    if let Err(err) = executor.context().checkpoints().save(agent_id, &checkpoint) {
        warn!(agent_id, err = %err, "failed to mark task completed");
    }
}

/// Sleep until `at`; false if cancelled first.
fn sleep_until(at: Instant, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let left = at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(CIRCUIT_POLL));
    }
}

fn log_stem(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Follow-ups across attempts, first occurrence per normalized title.
#[derive(Default)]
struct FollowUps {
    seen: HashSet<String>,
    items: Vec<FollowUpTask>,
}

impl FollowUps {
    fn extend(&mut self, tasks: &[FollowUpTask]) {
        for task in tasks {
            if self.seen.insert(normalize_title(&task.title)) {
                self.items.push(task.clone());
            }
        }
    }

    fn into_vec(self) -> Vec<FollowUpTask> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionContext;
    use crate::parse::ResultParser;
    use crate::test_support::{FakeVcs, script_config, task};

    fn context(root: &Path, script: &str) -> ExecutionContext {
        ExecutionContext::init(script_config(script), root)
            .expect("init")
            .with_parser(ResultParser::with_vcs(FakeVcs::default()))
    }

    #[test]
    fn loads_both_file_shapes_and_rejects_duplicates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let list = temp.path().join("list.json");
        fs::write(&list, r#"[{"id": "a", "title": "A"}]"#).expect("write");
        assert_eq!(load_tasks(&list).expect("load")[0].id, "a");

        let wrapped = temp.path().join("wrapped.json");
        fs::write(&wrapped, r#"{"tasks": [{"id": "b", "title": "B", "namespace": "ns"}]}"#)
            .expect("write");
        assert_eq!(load_tasks(&wrapped).expect("load")[0].namespace.as_deref(), Some("ns"));

        let dup = temp.path().join("dup.json");
        fs::write(&dup, r#"[{"id": "a", "title": "A"}, {"id": "a", "title": "B"}]"#)
            .expect("write");
        assert!(load_tasks(&dup).is_err());
    }

    #[test]
    fn completes_tasks_and_collects_follow_ups() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path(), "cat >/dev/null; echo 'Done.'; echo 'TODO: write docs'");
        let executor = AgentExecutor::new(&ctx);
        let tasks = vec![task("t1", Some("ns1")), task("t2", Some("ns2"))];
        let seen = Mutex::new(Vec::new());
        let settings = LoopSettings {
            log_dir: Some(temp.path().join("logs")),
            ..LoopSettings::default()
        };
        let report = run_loop(&executor, tasks, &settings, &|t: &TaskReport| {
            seen.lock().expect("lock").push(t.task_id.clone());
        })
        .expect("loop");

        assert_eq!(report.completed(), 2);
        assert_eq!(seen.lock().expect("lock").len(), 2);
        for t in &report.tasks {
            assert_eq!(t.follow_ups.len(), 1);
            assert_eq!(t.follow_ups[0].title, "write docs");
        }
        assert!(temp.path().join("logs/t1-1.log").exists());
        assert!(matches!(
            ctx.checkpoints().restore("t1").expect("restore").map(|c| c.phase),
            Some(CheckpointPhase::Completed)
        ));

        // A second run does not execute completed tasks again.
        let again = run_loop(&executor, vec![task("t1", Some("ns1"))], &settings, &|_: &TaskReport| {})
            .expect("loop");
        assert_eq!(again.tasks[0].outcome, TaskOutcome::AlreadyCompleted);
        ctx.teardown();
    }

    #[test]
    fn failing_task_is_exhausted_then_rejected_by_open_circuit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = script_config("echo 'Build FAILED'; exit 1");
        config.breaker.failure_threshold = 2;
        config.breaker.reset_timeout_ms = 60_000;
        let ctx = ExecutionContext::init(config, temp.path())
            .expect("init")
            .with_parser(ResultParser::with_vcs(FakeVcs::default()));
        let executor = AgentExecutor::new(&ctx);
        let settings = LoopSettings {
            max_attempts: 2,
            max_circuit_wait: Duration::from_millis(10),
            ..LoopSettings::default()
        };
        let tasks = vec![task("first", Some("ns")), task("second", Some("ns"))];
        let report = run_loop(&executor, tasks, &settings, &|_: &TaskReport| {}).expect("loop");

        assert_eq!(report.tasks[0].outcome, TaskOutcome::Exhausted { attempts: 2 });
        assert!(matches!(
            report.tasks[1].outcome,
            TaskOutcome::Rejected { attempts: 0, .. }
        ));
        assert_eq!(report.failed(), 1);
        assert_eq!(report.rejected(), 1);
        ctx.teardown();
    }

    #[test]
    fn key_capacity_bounds_parallel_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = script_config("cat >/dev/null; sleep 1; echo 'Done.'");
        config.concurrency.capacity.insert("ns1".to_string(), 2);
        let ctx = ExecutionContext::init(config, temp.path())
            .expect("init")
            .with_parser(ResultParser::with_vcs(FakeVcs::default()));
        let executor = AgentExecutor::new(&ctx);
        let mut urgent = task("b", Some("ns1"));
        urgent.priority = -1;
        let tasks = vec![task("a", Some("ns1")), urgent, task("c", Some("ns1"))];

        let started = Instant::now();
        let report =
            run_loop(&executor, tasks, &LoopSettings::default(), &|_: &TaskReport| {}).expect("loop");
        let elapsed = started.elapsed();

        assert_eq!(report.completed(), 3);
        let order: Vec<&str> = report.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order, ["b", "a", "c"]);
        // Three one-second tasks on two slots take two rounds, not three.
        assert!(elapsed >= Duration::from_secs(2), "took {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2900), "took {elapsed:?}");
        ctx.teardown();
    }

    #[test]
    fn done_tasks_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path(), "exit 1");
        let executor = AgentExecutor::new(&ctx);
        let mut done = task("d", None);
        done.status = TaskStatus::Done;
        let report = run_loop(&executor, vec![done], &LoopSettings::default(), &|_: &TaskReport| {})
            .expect("loop");
        assert_eq!(report.tasks[0].outcome, TaskOutcome::Skipped);
        ctx.teardown();
    }
}
