//! Follow-up task suggestions embedded in agent output.
//!
//! Two forms are recognized:
//!
//! - line markers: `TODO: <title>`, `NEXT: <title>`, `FOLLOWUP: <title>`, optionally
//!   bulleted, with an optional trailing `@agent` naming who should pick it up;
//! - fenced blocks tagged `followup-tasks` (or `follow-up-tasks`) holding a JSON
//!   array of strings or `{title, description?, agent?, priority?}` objects.
//!
//! Suggestions are deduplicated by normalized title; the first occurrence wins.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::core::types::{FollowUpTask, SuggestionSource};

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s+)?(TODO|NEXT|FOLLOW-?UP)\s*:\s*(.+?)\s*$").unwrap()
});

static AGENT_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+@([A-Za-z0-9_.-]+)$").unwrap());

const BLOCK_TAGS: [&str; 3] = ["followup-tasks", "follow-up-tasks", "followups"];

/// A follow-up block that could not be decoded.
#[derive(Debug, Error)]
#[error("malformed follow-up block starting at line {line}: {source}")]
pub struct FollowUpBlockError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockEntry {
    Title(String),
    Detailed {
        title: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default, alias = "suggested_agent")]
        agent: Option<String>,
        #[serde(default)]
        priority: Option<i32>,
    },
}

/// Extract follow-up suggestions in order of appearance.
pub fn parse_follow_ups(output: &str) -> Result<Vec<FollowUpTask>, FollowUpBlockError> {
    let mut found = Vec::new();
    let mut lines = output.lines().enumerate();

    while let Some((index, line)) = lines.next() {
        let trimmed = line.trim();
        if let Some(tag) = trimmed.strip_prefix("```") {
            let is_followup_block = BLOCK_TAGS.contains(&tag.trim());
            let mut body = String::new();
            for (_, inner) in lines.by_ref() {
                if inner.trim_start().starts_with("```") {
                    break;
                }
                body.push_str(inner);
                body.push('\n');
            }
            if is_followup_block {
                found.extend(parse_block(&body, index + 1)?);
            }
            continue;
        }
        if let Some(task) = parse_marker(line) {
            found.push(task);
        }
    }

    Ok(dedupe(found))
}

fn parse_marker(line: &str) -> Option<FollowUpTask> {
    let caps = MARKER_RE.captures(line)?;
    let source = match &caps[1] {
        "TODO" => SuggestionSource::Todo,
        "NEXT" => SuggestionSource::Next,
        _ => SuggestionSource::Followup,
    };
    let mut title = caps[2].to_string();
    let mut suggested_agent = None;
    if let Some(agent) = AGENT_SUFFIX_RE.captures(&title) {
        suggested_agent = Some(agent[1].to_string());
        let cut = agent.get(0).map_or(title.len(), |m| m.start());
        title.truncate(cut);
    }
    let title = title.trim().to_string();
    if title.is_empty() {
        return None;
    }
    Some(FollowUpTask {
        title,
        description: None,
        suggested_agent,
        priority: None,
        source,
    })
}

fn parse_block(body: &str, line: usize) -> Result<Vec<FollowUpTask>, FollowUpBlockError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<BlockEntry> =
        serde_json::from_str(body).map_err(|source| FollowUpBlockError { line, source })?;
    let tasks = entries
        .into_iter()
        .map(|entry| match entry {
            BlockEntry::Title(title) => FollowUpTask {
                title: title.trim().to_string(),
                description: None,
                suggested_agent: None,
                priority: None,
                source: SuggestionSource::Block,
            },
            BlockEntry::Detailed {
                title,
                description,
                agent,
                priority,
            } => FollowUpTask {
                title: title.trim().to_string(),
                description,
                suggested_agent: agent,
                priority,
                source: SuggestionSource::Block,
            },
        })
        .filter(|task| !task.title.is_empty())
        .collect();
    Ok(tasks)
}

/// Lowercased title with whitespace runs collapsed.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn dedupe(tasks: Vec<FollowUpTask>) -> Vec<FollowUpTask> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|task| seen.insert(normalize_title(&task.title)))
        .collect()
}
