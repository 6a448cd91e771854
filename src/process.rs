// Small extension traits over std/tokio process types. Generalized from the
// git-specific helpers this crate's ancestor kept inline in git.rs: logs the
// command before running it and turns "process was killed by a signal" into
// an explicit error rather than an Option the caller has to remember to
// check.

use std::process::{Output, Stdio};

use anyhow::{anyhow, Context as _};
use log::debug;
use tokio::process::Command;

pub trait CommandExt {
    /// Runs the command to completion, capturing stdout/stderr, logging the
    /// invocation at debug level first.
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        debug!("running: {:?}", self.as_std());
        self.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("spawning command")
    }
}

pub trait SyncCommandExt {
    fn execute_sync(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for std::process::Command {
    fn execute_sync(&mut self) -> anyhow::Result<Output> {
        debug!("running: {:?}", self);
        self.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("spawning command")
    }
}

pub trait OutputExt {
    /// Returns the exit code, or an error if the process was killed by a
    /// signal instead of exiting normally.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status.code_not_killed()
    }
}

pub trait ExitStatusExt {
    /// Returns the exit code, or an error if the process was killed by a
    /// signal instead of exiting normally.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl ExitStatusExt for std::process::ExitStatus {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.code().ok_or_else(|| anyhow!("process terminated by signal: {self:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_captures_output() {
        let mut cmd = Command::new("echo");
        cmd.arg("hi");
        let output = cmd.execute().await.unwrap();
        assert_eq!(output.code_not_killed().unwrap(), 0);
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 7"]);
        let output = cmd.execute().await.unwrap();
        assert_eq!(output.code_not_killed().unwrap(), 7);
    }
}
