//! Checkpoint-based recovery decisions.

use tracing::{debug, warn};

use crate::core::types::{AgentCheckpoint, CheckpointPhase};
use crate::io::checkpoint::CheckpointStore;

/// What a caller should do for an agent after a restart.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Continue from the checkpoint's iteration.
    Resumed {
        checkpoint: AgentCheckpoint,
        message: String,
    },
    /// No usable checkpoint: start fresh.
    NotFound,
    /// Already finished: do not execute again.
    Completed { checkpoint: AgentCheckpoint },
}

impl ResumeOutcome {
    /// Iteration the next attempt should record.
    pub fn next_iteration(&self) -> u32 {
        match self {
            Self::Resumed { checkpoint, .. } => checkpoint.iteration.saturating_add(1),
            Self::NotFound => 1,
            Self::Completed { checkpoint } => checkpoint.iteration,
        }
    }
}

/// Decide how to continue `agent_id`.
///
/// An unreadable checkpoint is reported as not found.
pub fn resume(store: &CheckpointStore, agent_id: &str) -> ResumeOutcome {
    let checkpoint = match store.restore(agent_id) {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => {
            debug!(agent_id, "no checkpoint, fresh start");
            return ResumeOutcome::NotFound;
        }
        Err(err) => {
            warn!(agent_id, err = %err, "checkpoint unreadable, treating as fresh start");
            return ResumeOutcome::NotFound;
        }
    };
    if checkpoint.phase == CheckpointPhase::Completed {
        debug!(agent_id, iteration = checkpoint.iteration, "already completed");
        return ResumeOutcome::Completed { checkpoint };
    }
    let message = format!(
        "resuming {agent_id} after iteration {} ({:?}, saved {})",
        checkpoint.iteration,
        checkpoint.phase,
        checkpoint.timestamp.to_rfc3339()
    );
    debug!(agent_id, %message, "resuming");
    ResumeOutcome::Resumed {
        checkpoint,
        message,
    }
}
