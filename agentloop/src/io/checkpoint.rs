//! Checkpoint storage: one JSON file per agent id.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::core::types::AgentCheckpoint;
use crate::io::write_atomic;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("invalid agent id '{0}'")]
    InvalidAgentId(String),
    #[error("checkpoint agent id '{found}' does not match '{expected}'")]
    AgentMismatch { expected: String, found: String },
    #[error("read checkpoint {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse checkpoint {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("write checkpoint {}: {cause:#}", .path.display())]
    Write { path: PathBuf, cause: anyhow::Error },
    #[error("remove checkpoint {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Checkpoint directory with per-agent write serialization.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `checkpoint` for `agent_id`, replacing any previous one atomically.
    pub fn save(&self, agent_id: &str, checkpoint: &AgentCheckpoint) -> Result<(), CheckpointError> {
        if checkpoint.agent_id != agent_id {
            return Err(CheckpointError::AgentMismatch {
                expected: agent_id.to_string(),
                found: checkpoint.agent_id.clone(),
            });
        }
        let path = self.path_for(agent_id)?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut buf = serde_json::to_vec_pretty(checkpoint).map_err(|source| {
            CheckpointError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;
        buf.push(b'\n');
        write_atomic(&path, &buf).map_err(|cause| CheckpointError::Write {
            path: path.clone(),
            cause,
        })?;
        debug!(
            agent_id,
            phase = ?checkpoint.phase,
            iteration = checkpoint.iteration,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Last saved checkpoint, or `None` when the agent has none.
    pub fn restore(&self, agent_id: &str) -> Result<Option<AgentCheckpoint>, CheckpointError> {
        let path = self.path_for(agent_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Read { path, source }),
        };
        let checkpoint: AgentCheckpoint = serde_json::from_str(&contents)
            .map_err(|source| CheckpointError::Corrupt { path, source })?;
        if checkpoint.agent_id != agent_id {
            return Err(CheckpointError::AgentMismatch {
                expected: agent_id.to_string(),
                found: checkpoint.agent_id,
            });
        }
        Ok(Some(checkpoint))
    }

    /// Remove the agent's checkpoint. Returns whether one existed.
    pub fn clear(&self, agent_id: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(agent_id)?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(agent_id, "checkpoint cleared");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Remove { path, source }),
        }
    }

    pub fn path_for(&self, agent_id: &str) -> Result<PathBuf, CheckpointError> {
        if agent_id.trim().is_empty() {
            return Err(CheckpointError::InvalidAgentId(agent_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", file_stem(agent_id))))
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(agent_id.to_string()).or_default())
    }
}

/// Escape everything outside `[A-Za-z0-9_-]` as `%XX` so distinct ids never share a file.
fn file_stem(agent_id: &str) -> String {
    let mut out = String::with_capacity(agent_id.len());
    for byte in agent_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::core::types::CheckpointPhase;

    #[test]
    fn save_then_restore_returns_same_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path().join("checkpoints"));
        let checkpoint = AgentCheckpoint::new(
            "agent-1",
            CheckpointPhase::Running,
            4,
            json!({"cursor": 12, "notes": ["a", "b"]}),
        );
        store.save("agent-1", &checkpoint).expect("save");
        assert_eq!(store.restore("agent-1").expect("restore"), Some(checkpoint));
    }

    #[test]
    fn restore_missing_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        assert_eq!(store.restore("nobody").expect("restore"), None);
    }

    #[test]
    fn save_overwrites_and_clear_removes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        for iteration in 1..=3 {
            let checkpoint =
                AgentCheckpoint::new("a", CheckpointPhase::Running, iteration, json!(null));
            store.save("a", &checkpoint).expect("save");
        }
        let restored = store.restore("a").expect("restore").expect("present");
        assert_eq!(restored.iteration, 3);

        assert!(store.clear("a").expect("clear"));
        assert!(!store.clear("a").expect("clear again"));
        assert_eq!(store.restore("a").expect("restore"), None);
    }

    #[test]
    fn distinct_ids_never_share_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let a = store.path_for("ns/task").expect("path");
        let b = store.path_for("ns_task").expect("path");
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(temp.path()));
        assert!(store.path_for("  ").is_err());
    }

    #[test]
    fn corrupt_file_is_an_error_and_leaves_no_partial_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let path = store.path_for("a").expect("path");
        fs::write(&path, "{\"agent_id\": \"a\", ").expect("write");
        assert!(matches!(
            store.restore("a"),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn rejects_checkpoint_for_other_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let checkpoint = AgentCheckpoint::new("b", CheckpointPhase::Running, 1, json!({}));
        assert!(matches!(
            store.save("a", &checkpoint),
            Err(CheckpointError::AgentMismatch { .. })
        ));
    }

    #[test]
    fn concurrent_saves_leave_a_valid_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(CheckpointStore::new(temp.path()));
        let handles: Vec<_> = (0..8)
            .map(|iteration| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let checkpoint =
                        AgentCheckpoint::new("shared", CheckpointPhase::Running, iteration, json!({}));
                    store.save("shared", &checkpoint).expect("save");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let restored = store.restore("shared").expect("restore").expect("present");
        assert!(restored.iteration < 8);
    }
}
