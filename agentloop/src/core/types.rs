//! Shared deterministic types for the execution core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task as reported by the task backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Blocked,
}

/// A unit of work handed to the loop. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: TaskStatus,
    /// Partition key for admission and circuit breaking (e.g. a namespace).
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One entry of the ordered model list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Lower ranks are tried first.
    #[serde(default)]
    pub priority: u32,
    /// Eligible once the selector is in fallback mode.
    #[serde(default)]
    pub fallback: bool,
}

/// Outcome classification derived from exit code and output text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
    Partial,
}

impl ResultStatus {
    /// True for outcomes that count as progress (reset the breaker).
    pub fn is_progress(self) -> bool {
        !matches!(self, ResultStatus::Failure)
    }
}

/// How a file changed during an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A file touched by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub change: ChangeKind,
}

/// Counters extracted from an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Wall-clock duration measured by the caller.
    pub duration_ms: u64,
    pub tokens_used: Option<u64>,
    pub tool_calls: Option<u64>,
}

impl Metrics {
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            ..Self::default()
        }
    }
}

/// Where a follow-up suggestion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionSource {
    Todo,
    Next,
    Followup,
    Block,
}

/// A suggested future unit of work extracted from output text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub source: SuggestionSource,
}

/// Structured outcome of one attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub status: ResultStatus,
    pub artifacts: Vec<Artifact>,
    pub metrics: Metrics,
    pub follow_up_tasks: Vec<FollowUpTask>,
    pub summary: String,
    /// Verbatim input text; never rewritten.
    pub raw_output: String,
}

/// Checkpoint phase for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    Running,
    Completed,
    Failed,
    Paused,
}

/// Persisted snapshot of an agent's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub agent_id: String,
    pub phase: CheckpointPhase,
    pub iteration: u32,
    /// Opaque to the core.
    pub state: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentCheckpoint {
    pub fn new(
        agent_id: impl Into<String>,
        phase: CheckpointPhase,
        iteration: u32,
        state: serde_json::Value,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            phase,
            iteration,
            state,
            timestamp: Utc::now(),
        }
    }
}
