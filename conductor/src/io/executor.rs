//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the Ralph loop and merge resolution from
//! the actual agent backend (currently the `claude` CLI). Tests use scripted
//! executors that return predetermined outputs without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Prompt text to feed to the agent. Identical on every loop iteration.
    pub prompt: String,
    /// Working directory for the executor process (the task's worktree).
    pub workdir: PathBuf,
    /// Tools the agent may use, e.g. `["Read", "Edit", "Bash"]`.
    pub allowed_tools: Vec<String>,
    pub model: Option<String>,
    /// Maximum time to wait for the executor to complete.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// What an executor invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub output: String,
    /// `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over agent execution backends.
pub trait Executor: Send + Sync {
    /// Run the agent once. Timeouts and nonzero exits are reported in the
    /// result; `Err` means the agent could not be run at all.
    fn exec(&self, request: &ExecRequest) -> Result<ExecResult>;

    /// Reclaim anything the executor still holds for `workdir`. Called when a
    /// loop is cancelled.
    fn release(&self, _workdir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Executor that spawns `claude -p`.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    claude_path: PathBuf,
}

impl ClaudeExecutor {
    pub fn new(claude_path: impl Into<PathBuf>) -> Self {
        Self {
            claude_path: claude_path.into(),
        }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.claude_path);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json");
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl Executor for ClaudeExecutor {
    #[instrument(skip_all, fields(workdir = %request.workdir.display(), timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecResult> {
        info!(claude = %self.claude_path.display(), "starting claude");
        let output = run_command_with_timeout(
            self.command(request),
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run claude")?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "claude timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "claude failed");
        }

        let text = match parse_envelope(&output.stdout_lossy()) {
            Some(result) => result,
            None => output.combined_lossy(),
        };
        debug!(bytes = text.len(), "claude finished");
        Ok(ExecResult {
            output: text,
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            duration: output.duration,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeEnvelope {
    result: Option<String>,
}

/// Pull `result` out of `--output-format json` output, if it is an envelope.
fn parse_envelope(stdout: &str) -> Option<String> {
    let envelope: ClaudeEnvelope = serde_json::from_str(stdout.trim()).ok()?;
    envelope.result
}
