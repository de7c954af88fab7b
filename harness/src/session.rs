//! Session execution against the `claude` CLI.
//!
//! The [`SessionRunner`] trait decouples the loop from the actual agent
//! backend. Tests use scripted runners that return predetermined outcomes
//! without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::process::run_command_with_timeout;

/// Parameters for one agent session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Working directory for the session (the project checkout).
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Wall-clock budget for the session.
    pub timeout: Duration,
    /// Truncate captured session output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// File the session transcript is appended to.
    pub log_path: PathBuf,
}

/// Abstraction over agent session backends.
pub trait SessionRunner {
    /// Run one session to completion. An `Err` counts as a session failure
    /// and feeds the loop's backoff; it must never carry a panic.
    fn run(&self, request: &SessionRequest) -> Result<()>;
}

/// Runner that spawns the `claude` CLI in headless mode.
pub struct ClaudeSession;

impl SessionRunner for ClaudeSession {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &SessionRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "starting claude session");

        let mut cmd = Command::new("claude");
        cmd.arg("-p")
            .arg("--output-format")
            .arg("text")
            .arg("--dangerously-skip-permissions")
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run claude session")?;

        append_session_log(&request.log_path, &output.render_log("session"))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "claude session timed out");
            return Err(anyhow!(
                "claude session timed out after {:?}",
                request.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "claude session failed");
            return Err(anyhow!(
                "claude session failed with status {:?}",
                output.status.code()
            ));
        }

        debug!("claude session completed");
        Ok(())
    }
}

fn append_session_log(path: &Path, entry: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create session log dir {}", parent.display()))?;
    }
    let mut contents = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    contents.push_str(entry);
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    fs::write(path, contents).with_context(|| format!("write session log {}", path.display()))
}
