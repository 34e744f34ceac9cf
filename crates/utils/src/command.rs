//! Extension traits for running subprocesses.

use std::io::Read;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Render a command for error messages and logs.
fn command_repr(cmd: &Command) -> String {
    let mut r = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        r.push(' ');
        r.push_str(&arg.to_string_lossy());
    }
    r
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the command we're executing.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, returning an error if it exits unsuccessfully.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process; capture stderr and include it in the
    /// error message on failure. Stdout is discarded.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string,
    /// trimming trailing whitespace.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and deserialize its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", command_repr(self));
        self
    }

    fn run(&mut self) -> Result<()> {
        let st = self
            .status()
            .with_context(|| format!("Spawning {}", command_repr(self)))?;
        if !st.success() {
            anyhow::bail!("{} failed: {st}", command_repr(self));
        }
        Ok(())
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let mut child = self
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {}", command_repr(self)))?;
        let mut stderr = String::new();
        if let Some(mut f) = child.stderr.take() {
            // Best-effort; stderr may not be UTF-8
            let _ = f.read_to_string(&mut stderr);
        }
        let st = child.wait()?;
        if !st.success() {
            anyhow::bail!("{} failed: {st}: {}", command_repr(self), stderr.trim());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let o = self
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("Spawning {}", command_repr(self)))?;
        if !o.status.success() {
            anyhow::bail!("{} failed: {}", command_repr(self), o.status);
        }
        let mut s = String::from_utf8(o.stdout).context("Parsing command output as UTF-8")?;
        s.truncate(s.trim_end().len());
        Ok(s)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let o = self
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("Spawning {}", command_repr(self)))?;
        if !o.status.success() {
            anyhow::bail!("{} failed: {}", command_repr(self), o.status);
        }
        serde_json::from_slice(&o.stdout)
            .with_context(|| format!("Parsing JSON output of {}", command_repr(self)))
    }
}
