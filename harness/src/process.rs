//! Timeout-guarded child processes with bounded output capture.
//!
//! Both the worker (claude sessions, store sync CLIs) and the orchestrator
//! (docker/aws/gcloud invocations) run external commands that can hang or
//! produce unbounded output; everything goes through this helper.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the capture limit, per stream.
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Render stdout and stderr as one annotated log block.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_text());
        if self.stdout_dropped > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout dropped {} bytes]\n",
                self.stdout_dropped
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_text());
        if self.stderr_dropped > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr dropped {} bytes]\n",
                self.stderr_dropped
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run a command with a timeout, feeding optional stdin and capturing
/// stdout/stderr without risking pipe deadlocks.
///
/// Output is drained concurrently while the child runs; bytes beyond
/// `output_limit_bytes` per stream are counted and discarded. On timeout
/// the child is killed and `timed_out` is set instead of returning an
/// error, so callers decide what a timeout means.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Drop closes the pipe so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_dropped) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_dropped) = join_reader(stderr_handle).context("join stderr")?;

    if stdout_dropped > 0 || stderr_dropped > 0 {
        warn!(stdout_dropped, stderr_dropped, "command output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .unwrap_or_else(|_| Err(anyhow!("output reader thread panicked")))
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }

    Ok((buf, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2");
        let output =
            run_command_with_timeout(cmd, None, Duration::from_secs(5), 10_000).expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout_text().trim(), "out");
        assert_eq!(output.stderr_text().trim(), "err");
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin_to_child() {
        let cmd = Command::new("cat");
        let output =
            run_command_with_timeout(cmd, Some(b"hello"), Duration::from_secs(5), 10_000)
                .expect("run");
        assert_eq!(output.stdout_text(), "hello");
    }

    #[test]
    fn drops_output_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("head -c 1000 /dev/zero");
        let output =
            run_command_with_timeout(cmd, None, Duration::from_secs(5), 100).expect("run");
        assert_eq!(output.stdout.len(), 100);
        assert_eq!(output.stdout_dropped, 900);
        assert!(output.render_log("test").contains("dropped 900 bytes"));
    }

    #[test]
    fn kills_child_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let output =
            run_command_with_timeout(cmd, None, Duration::from_millis(100), 1000).expect("run");
        assert!(output.timed_out);
    }
}
