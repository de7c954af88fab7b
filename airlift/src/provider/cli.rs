//! Subprocess transport for CLI-wrapping adapters.
//!
//! The docker and aws adapters drive their backends through the official
//! CLIs. This seam keeps the adapters testable: production uses
//! [`SystemCli`], tests script responses.

use std::process::Command;
use std::time::Duration;

use airlift_harness::process::run_command_with_timeout;
use anyhow::{Context, Result, anyhow};
use tracing::debug;

/// Captured CLI invocation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// One backend CLI (a fixed program, varying arguments).
pub trait CliRunner {
    fn invoke(&self, args: &[&str]) -> Result<CliOutput>;
}

/// Runner that spawns the real program.
pub struct SystemCli {
    program: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl SystemCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(120),
            output_limit_bytes: 512 * 1024,
        }
    }
}

impl CliRunner for SystemCli {
    fn invoke(&self, args: &[&str]) -> Result<CliOutput> {
        debug!(program = %self.program, ?args, "invoking backend CLI");
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| {
                format!("run '{}' (is the {} CLI installed?)", self.program, self.program)
            })?;
        if output.timed_out {
            return Err(anyhow!("'{} {}' timed out", self.program, args.join(" ")));
        }
        Ok(CliOutput {
            success: output.status.success(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
        })
    }
}
