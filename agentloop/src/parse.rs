//! Composite result parser.
//!
//! Runs the status, artifact, metrics, follow-up and summary sub-parsers over one
//! attempt's exit code and output and merges them into a [`ParsedResult`]. Parse
//! failures never escape: a malformed payload degrades to a minimal result that
//! still carries the verbatim output.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::artifacts::{artifacts_from_name_status, artifacts_from_status, merge_artifacts};
use crate::core::followups::{FollowUpBlockError, parse_follow_ups};
use crate::core::metrics::extract_metrics;
use crate::core::status::{classify_status, status_from_exit_code};
use crate::core::summary::summarize;
use crate::core::types::{Artifact, Metrics, ParsedResult};
use crate::io::git::VersionControl;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    FollowUpBlock(#[from] FollowUpBlockError),
}

/// What an attempt produced.
#[derive(Debug, Clone, Copy)]
pub struct ParseInput<'a> {
    /// `None` when the process was killed or its exit was never observed.
    pub exit_code: Option<i32>,
    pub output: &'a str,
    /// Caller-measured wall clock.
    pub duration: Duration,
    /// Diff base for committed changes; working-tree status is always consulted.
    pub base_ref: Option<&'a str>,
}

#[derive(Clone, Default)]
pub struct ResultParser {
    vcs: Option<Arc<dyn VersionControl + Send + Sync>>,
}

impl std::fmt::Debug for ResultParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultParser")
            .field("vcs", &self.vcs.is_some())
            .finish()
    }
}

impl ResultParser {
    pub fn with_vcs(vcs: impl VersionControl + Send + Sync + 'static) -> Self {
        Self {
            vcs: Some(Arc::new(vcs)),
        }
    }

    /// Parser without a version-control collaborator; artifacts are always empty.
    pub fn text_only() -> Self {
        Self::default()
    }

    pub fn parse(&self, input: &ParseInput<'_>) -> ParsedResult {
        match self.try_parse(input) {
            Ok(result) => {
                debug!(
                    status = ?result.status,
                    artifacts = result.artifacts.len(),
                    follow_ups = result.follow_up_tasks.len(),
                    "parsed attempt output"
                );
                result
            }
            Err(err) => {
                warn!(err = %err, "output parse failed, using minimal result");
                minimal_result(input)
            }
        }
    }

    fn try_parse(&self, input: &ParseInput<'_>) -> Result<ParsedResult, ParseError> {
        let follow_up_tasks = parse_follow_ups(input.output)?;
        Ok(ParsedResult {
            status: classify_status(input.exit_code, input.output),
            artifacts: self.detect_artifacts(input.base_ref),
            metrics: extract_metrics(input.output, input.duration),
            follow_up_tasks,
            summary: summarize(input.output),
            raw_output: input.output.to_string(),
        })
    }

    /// Changed files from the collaborator. Errors are logged and yield no artifacts.
    pub fn detect_artifacts(&self, base_ref: Option<&str>) -> Vec<Artifact> {
        let Some(vcs) = &self.vcs else {
            return Vec::new();
        };
        let mut lists = Vec::new();
        if let Some(base) = base_ref {
            match vcs
                .diff(&[base])
                .and_then(|diff| artifacts_from_name_status(&diff))
            {
                Ok(list) => lists.push(list),
                Err(err) => warn!(base, err = %format!("{err:#}"), "artifact diff failed"),
            }
        }
        match vcs
            .status()
            .and_then(|status| artifacts_from_status(&status))
        {
            Ok(list) => lists.push(list),
            Err(err) => warn!(err = %format!("{err:#}"), "artifact status failed"),
        }
        merge_artifacts(lists)
    }
}

fn minimal_result(input: &ParseInput<'_>) -> ParsedResult {
    ParsedResult {
        status: status_from_exit_code(input.exit_code),
        artifacts: Vec::new(),
        metrics: Metrics::with_duration(input.duration),
        follow_up_tasks: Vec::new(),
        summary: summarize(input.output),
        raw_output: input.output.to_string(),
    }
}
