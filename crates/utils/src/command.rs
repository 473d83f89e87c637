//! Extensions for running external processes.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Maximum number of stderr bytes we carry into an error message.
const MAX_STDERR_BYTES: usize = 1024;

/// Helpers for synchronously spawning a child process and gathering
/// its output, turning unsuccessful exits into errors that carry the
/// tail of the child's stderr.
pub trait CommandRunExt {
    /// Log (at debug level) the command we're about to execute.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. An unsuccessful
    /// exit status becomes an error.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process, returning its stdout as a string
    /// with trailing whitespace trimmed.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

/// Render a failed invocation, including a bounded amount of stderr.
fn command_error(cmd: &Command, st: &std::process::ExitStatus, stderr: &[u8]) -> anyhow::Error {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let tail_start = stderr.len().saturating_sub(MAX_STDERR_BYTES);
    let stderr = String::from_utf8_lossy(&stderr[tail_start..]);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::anyhow!("{program} failed: {st}")
    } else {
        anyhow::anyhow!("{program} failed: {st}: {stderr}")
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        let spawned = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        let output = spawned.with_context(|| format!("spawning {:?}", self.get_program()))?;
        if !output.status.success() {
            return Err(command_error(self, &output.status, &output.stderr));
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let spawned = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        let output = spawned.with_context(|| format!("spawning {:?}", self.get_program()))?;
        if !output.status.success() {
            return Err(command_error(self, &output.status, &output.stderr));
        }
        let mut stdout =
            String::from_utf8(output.stdout).context("command output was not UTF-8")?;
        stdout.truncate(stdout.trim_end().len());
        Ok(stdout)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let stdout = self.run_get_string()?;
        serde_json::from_str(&stdout).context("parsing command output as JSON")
    }
}
