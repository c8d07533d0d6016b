//! Classification of version-control output into changed-file artifacts.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

use crate::core::types::{Artifact, ChangeKind};

/// Parsed `git status --porcelain=v1` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn change_kind(&self) -> ChangeKind {
        if self.code == "??" || self.code.contains('A') {
            ChangeKind::Added
        } else if self.code.contains('D') {
            ChangeKind::Deleted
        } else {
            ChangeKind::Modified
        }
    }
}

pub fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Artifacts from porcelain status output.
pub fn artifacts_from_status(porcelain: &str) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for line in porcelain.lines().filter(|l| !l.trim().is_empty()) {
        let entry = parse_status_line(line)?;
        artifacts.push(Artifact {
            change: entry.change_kind(),
            path: entry.path,
        });
    }
    Ok(artifacts)
}

/// Artifacts from `git diff --name-status` output.
///
/// Renames and copies count as an addition of the new path (and, for renames,
/// a deletion of the old one).
pub fn artifacts_from_name_status(diff: &str) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for line in diff.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split('\t');
        let code = fields.next().unwrap_or_default();
        let paths: Vec<&str> = fields.collect();
        let kind = code.chars().next();
        match (kind, paths.as_slice()) {
            (Some('A'), [path]) => artifacts.push(artifact(path, ChangeKind::Added)),
            (Some('D'), [path]) => artifacts.push(artifact(path, ChangeKind::Deleted)),
            (Some('M' | 'T'), [path]) => artifacts.push(artifact(path, ChangeKind::Modified)),
            (Some('R'), [old, new]) => {
                artifacts.push(artifact(old, ChangeKind::Deleted));
                artifacts.push(artifact(new, ChangeKind::Added));
            }
            (Some('C'), [_, new]) => artifacts.push(artifact(new, ChangeKind::Added)),
            _ => return Err(anyhow!("unexpected name-status line: '{line}'")),
        }
    }
    Ok(artifacts)
}

/// Merge artifact lists, one entry per path, sorted by path.
///
/// Later lists win for a path seen twice (working-tree status refines the diff).
pub fn merge_artifacts(lists: impl IntoIterator<Item = Vec<Artifact>>) -> Vec<Artifact> {
    let mut by_path = BTreeMap::new();
    for artifact in lists.into_iter().flatten() {
        by_path.insert(artifact.path.clone(), artifact.change);
    }
    by_path
        .into_iter()
        .map(|(path, change)| Artifact { path, change })
        .collect()
}

fn artifact(path: &str, change: ChangeKind) -> Artifact {
    Artifact {
        path: unquote(path.trim()),
        change,
    }
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
