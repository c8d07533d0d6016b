//! Git adapter used to detect files an agent changed.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Read-only view of a working tree's changes.
pub trait VersionControl {
    /// `diff --name-status` output for the given extra arguments (e.g. a base ref).
    fn diff(&self, args: &[&str]) -> Result<String>;

    /// Porcelain v1 status including untracked files.
    fn status(&self) -> Result<String>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD sha.
    pub fn head(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True if the working directory is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    fn diff(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["diff", "--name-status"];
        full.extend_from_slice(args);
        let out = self.run_capture(&full)?;
        debug!(lines = out.lines().count(), "git diff");
        Ok(out)
    }

    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    fn status(&self) -> Result<String> {
        self.run_capture(&["status", "--porcelain=v1", "-uall"])
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::artifacts::artifacts_from_status;
    use crate::core::types::ChangeKind;

    fn init_repo(dir: &Path) -> Git {
        let git = Git::new(dir);
        git.run_checked(&["init", "-q"]).expect("git init");
        git.run_checked(&["config", "user.email", "loop@example.com"])
            .expect("config email");
        git.run_checked(&["config", "user.name", "loop"])
            .expect("config name");
        git
    }

    #[test]
    fn reports_changes_against_head() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = init_repo(temp.path());
        fs::write(temp.path().join("a.txt"), "one\n").expect("write");
        git.run_checked(&["add", "-A"]).expect("add");
        git.run_checked(&["commit", "-q", "-m", "init"])
            .expect("commit");
        let head = git.head().expect("head");
        assert!(git.is_repo());

        fs::write(temp.path().join("a.txt"), "two\n").expect("write");
        fs::write(temp.path().join("b.txt"), "new\n").expect("write");

        let diff = git.diff(&[&head]).expect("diff");
        assert_eq!(diff.trim(), "M\ta.txt");

        let artifacts = artifacts_from_status(&git.status().expect("status")).expect("parse");
        assert_eq!(artifacts.len(), 2);
        assert!(
            artifacts
                .iter()
                .any(|a| a.path == "b.txt" && a.change == ChangeKind::Added)
        );
    }

    #[test]
    fn status_outside_repo_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        assert!(!git.is_repo());
        assert!(git.status().is_err());
    }
}
