//! Child process execution with a hard timeout and bounded output.
//!
//! Every tmux invocation goes through here.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout decoded lossily, without the trailing newline.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout)
            .trim_end_matches(['\n', '\r'])
            .to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Fail with `label` and stderr unless the command succeeded.
    pub fn ensure_success(self, label: &str) -> Result<Self> {
        if self.timed_out {
            bail!("{label}: timed out");
        }
        if !self.status.success() {
            bail!(
                "{label}: exit {:?}: {}",
                self.status.code(),
                self.stderr_text()
            );
        }
        Ok(self)
    }
}

/// Run `cmd` to completion, killing it after `timeout`.
///
/// Stdin is closed. Stdout and stderr are drained concurrently so a chatty
/// child cannot deadlock on a full pipe; bytes beyond `output_limit_bytes` are
/// discarded.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(program = ?cmd.get_program(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, _) = join_output(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 {
        warn!(stdout_truncated, "command output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'hello\\n'; exit 3"]);
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 1024).expect("run");
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(output.status.code(), Some(3));
        assert!(output.ensure_success("sh").is_err());
    }

    #[test]
    fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 5"]);
        let output =
            run_command_with_timeout(cmd, Duration::from_millis(50), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdefghij'"]);
        let output = run_command_with_timeout(cmd, Duration::from_secs(5), 4).expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
    }
}
