//! Agent command construction and attempt logs.

use std::path::Path;

use anyhow::{Result, anyhow};

use crate::io::config::{AgentConfig, PromptMode};
use crate::io::process::{CommandOutput, SpawnRequest};
use crate::io::write_atomic;

/// Build the spawn request for one agent invocation.
///
/// The model flag is only added when both a model and a flag are configured.
pub fn spawn_request(config: &AgentConfig, prompt: &str, model: Option<&str>) -> Result<SpawnRequest> {
    let (program, base_args) = config
        .command
        .split_first()
        .ok_or_else(|| anyhow!("agent.command is empty"))?;
    let mut request = SpawnRequest::new(program.clone());
    request.args.extend(base_args.iter().cloned());
    if let Some(model) = model
        && !config.model_flag.is_empty()
    {
        request.args.push(config.model_flag.clone());
        request.args.push(model.to_string());
    }
    match config.prompt_mode {
        PromptMode::Stdin => request.stdin = Some(prompt.as_bytes().to_vec()),
        PromptMode::Arg => request.args.push(prompt.to_string()),
    }
    request.env.clone_from(&config.env);
    request.nice = config.nice;
    Ok(request)
}

/// Write the captured stdout/stderr of an attempt to `path`.
pub fn write_attempt_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    buf.push_str(&output.stdout_truncated_notice("agent"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    buf.push_str(&output.stderr_truncated_notice("agent"));
    for err in &output.stream_errors {
        buf.push_str(&format!("\n[stream error: {err}]\n"));
    }
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    if output.cancelled {
        buf.push_str("\n[agent cancelled]\n");
    }
    match output.exit_code() {
        Some(code) => buf.push_str(&format!("\n[exit code {code}]\n")),
        None => buf.push_str("\n[no exit observed]\n"),
    }
    write_atomic(path, buf.as_bytes())
}
