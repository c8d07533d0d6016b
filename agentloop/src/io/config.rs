//! Loop configuration stored under `.agentloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::breaker::{Backoff, BreakerSettings};
use crate::core::types::ModelConfig;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that work for a single local agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Checkpoint directory, relative to the project root unless absolute.
    pub checkpoint_dir: PathBuf,

    pub agent: AgentConfig,

    pub models: Vec<ModelConfig>,

    pub selector: SelectorConfig,

    pub breaker: BreakerConfig,

    pub concurrency: ConcurrencyConfig,

    pub orphans: OrphanConfig,
}

/// How the prompt reaches the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Written to stdin, then stdin is closed.
    #[default]
    Stdin,
    /// Appended as the last argument.
    Arg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv (e.g. `["codex", "exec"]`).
    pub command: Vec<String>,
    /// Flag used to pass the selected model; empty disables it.
    pub model_flag: String,
    pub prompt_mode: PromptMode,
    /// Per-attempt wall-clock budget in seconds.
    pub timeout_secs: u64,
    /// Grace window between the graceful-stop and forceful-kill signals.
    pub kill_grace_secs: u64,
    /// Scheduling niceness for the agent process.
    pub nice: Option<i32>,
    /// Captured stdout/stderr beyond this many bytes is discarded.
    pub output_limit_bytes: usize,
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            model_flag: "--model".to_string(),
            prompt_mode: PromptMode::Stdin,
            timeout_secs: 30 * 60,
            kill_grace_secs: 5,
            nice: None,
            output_limit_bytes: 1_000_000,
            env: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelectorConfig {
    /// Consecutive failed attempts before switching to the fallback models.
    pub fallback_after_failures: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            fallback_after_failures: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub backoff: Backoff,
    pub max_reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 60_000,
            backoff: Backoff::Exponential,
            max_reset_timeout_ms: 15 * 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            backoff: self.backoff,
            max_reset_timeout: Duration::from_millis(self.max_reset_timeout_ms),
        }
    }
}

/// What `acquire` does when a key is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFull {
    /// Wait in FIFO order (bounded by `wait_timeout_ms` when set).
    #[default]
    Queue,
    /// Fail immediately.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub default_capacity: usize,
    pub on_full: OnFull,
    pub wait_timeout_ms: Option<u64>,
    /// Capacity overrides by full key (`ns/kind`) or namespace.
    pub capacity: BTreeMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_capacity: 1,
            on_full: OnFull::Queue,
            wait_timeout_ms: None,
            capacity: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrphanConfig {
    /// Seconds between orphan sweeps; 0 disables the watcher.
    pub check_interval_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".agentloop/checkpoints"),
            agent: AgentConfig::default(),
            models: Vec::new(),
            selector: SelectorConfig::default(),
            breaker: BreakerConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            orphans: OrphanConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if let Some(nice) = self.agent.nice
            && !(-20..=19).contains(&nice)
        {
            return Err(anyhow!("agent.nice must be within -20..=19"));
        }
        if self.selector.fallback_after_failures == 0 {
            return Err(anyhow!("selector.fallback_after_failures must be > 0"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(anyhow!("breaker.failure_threshold must be > 0"));
        }
        if self.breaker.reset_timeout_ms == 0 {
            return Err(anyhow!("breaker.reset_timeout_ms must be > 0"));
        }
        if self.concurrency.default_capacity == 0 {
            return Err(anyhow!("concurrency.default_capacity must be > 0"));
        }
        if let Some((key, _)) = self.concurrency.capacity.iter().find(|(_, cap)| **cap == 0) {
            return Err(anyhow!("concurrency.capacity.{key} must be > 0"));
        }
        let mut names: Vec<&str> = self.models.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(anyhow!("duplicate model name '{}'", pair[0]));
        }
        Ok(())
    }

    /// Resolve the checkpoint directory against the project root.
    pub fn checkpoint_dir(&self, root: &Path) -> PathBuf {
        if self.checkpoint_dir.is_absolute() {
            self.checkpoint_dir.clone()
        } else {
            root.join(&self.checkpoint_dir)
        }
    }
}

/// Default config location under a project root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(".agentloop").join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = LoopConfig::default();
        cfg.models.push(ModelConfig {
            name: "gpt-5".to_string(),
            priority: 0,
            fallback: false,
        });
        cfg.concurrency.capacity.insert("ns1".to_string(), 2);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[breaker]\nfailure_threshold = 5\n\n[[models]]\nname = \"small\"\nfallback = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert!(cfg.models[0].fallback);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut cfg = LoopConfig::default();
        cfg.concurrency.capacity.insert("ns1".to_string(), 0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency.capacity.ns1"));
    }

    #[test]
    fn rejects_duplicate_models() {
        let mut cfg = LoopConfig::default();
        for _ in 0..2 {
            cfg.models.push(ModelConfig {
                name: "m".to_string(),
                priority: 0,
                fallback: false,
            });
        }
        assert!(cfg.validate().is_err());
    }
}
