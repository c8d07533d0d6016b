//! Test-only helpers: a scripted version-control collaborator, shell-script agent
//! configs and task builders.

use anyhow::{Result, anyhow};

use crate::core::types::{Task, TaskStatus};
use crate::io::config::{LoopConfig, PromptMode};
use crate::io::git::VersionControl;

/// Version-control fake returning fixed text.
#[derive(Debug, Clone, Default)]
pub struct FakeVcs {
    pub diff: String,
    pub status: String,
    /// Every call fails when set.
    pub fail: bool,
}

impl VersionControl for FakeVcs {
    fn diff(&self, _args: &[&str]) -> Result<String> {
        if self.fail {
            return Err(anyhow!("git diff failed: scripted failure"));
        }
        Ok(self.diff.clone())
    }

    fn status(&self) -> Result<String> {
        if self.fail {
            return Err(anyhow!("git status failed: scripted failure"));
        }
        Ok(self.status.clone())
    }
}

/// Config whose agent is `sh -c <script>`, prompt on stdin, no model flag, a short
/// kill grace and no orphan watcher.
pub fn script_config(script: &str) -> LoopConfig {
    let mut config = LoopConfig::default();
    config.agent.command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    config.agent.model_flag.clear();
    config.agent.prompt_mode = PromptMode::Stdin;
    config.agent.timeout_secs = 30;
    config.agent.kill_grace_secs = 1;
    config.orphans.check_interval_secs = 0;
    config
}

/// Pending task with deterministic title and description.
pub fn task(id: &str, namespace: Option<&str>) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        priority: 0,
        status: TaskStatus::Pending,
        namespace: namespace.map(str::to_string),
        created_at: None,
        updated_at: None,
    }
}
