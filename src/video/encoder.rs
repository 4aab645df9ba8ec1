use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

/// One encoder child process with piped stdin/stdout and its stderr
/// appended to a per-role log file.
pub struct EncoderCommand {
    name: String,
    child: Child,
}

impl EncoderCommand {
    pub fn spawn(program: &str, args: &[String], log_path: &Path) -> Result<Self> {
        let log = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_path)
            .with_context(|| format!("opening encoder log {}", log_path.display()))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log))
            .spawn()
            .with_context(|| format!("spawning {program}"))?;

        Ok(Self {
            name: program.to_string(),
            child,
        })
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child
            .stdin
            .take()
            .with_context(|| format!("{} stdin already taken", self.name))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .with_context(|| format!("{} stdout already taken", self.name))
    }

    /// Waits for the child to exit within `grace`, killing it otherwise.
    pub async fn wait_or_kill(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    warn!(command = %self.name, %status, "encoder command failed");
                }
            }
            Ok(Err(e)) => warn!(command = %self.name, error = %e, "could not wait for encoder"),
            Err(_) => {
                warn!(command = %self.name, grace = ?grace, "killing encoder, did not stop in time");
                if let Err(e) = self.child.kill().await {
                    warn!(command = %self.name, error = %e, "could not kill encoder");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_spawn_pipes_and_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("cat.log");

        let mut cmd =
            EncoderCommand::spawn("cat", &[], &log).expect("spawn cat");
        let mut stdin = cmd.take_stdin().expect("stdin");
        let mut stdout = cmd.take_stdout().expect("stdout");

        stdin.write_all(b"pass through").await.expect("write");
        drop(stdin);

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"pass through");

        cmd.wait_or_kill(Duration::from_secs(1)).await;
        assert!(log.exists(), "stderr log file created");
    }

    #[tokio::test]
    async fn test_wait_or_kill_kills_a_stuck_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("sleep.log");

        let mut cmd = EncoderCommand::spawn("sleep", &["30".to_string()], &log)
            .expect("spawn sleep");

        let started = std::time::Instant::now();
        cmd.wait_or_kill(Duration::from_millis(50)).await;
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "child was killed instead of waited for",
        );
    }
}
