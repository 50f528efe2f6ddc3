// backuptool/src/utils/command.rs
//
// Narrow seam around external command execution so strategy-selection logic
// can be exercised in tests without a real pg_dump on the machine.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and extra environment variables, bounded by
    /// `timeout`. A timeout or spawn failure is an error; a non-zero exit is
    /// reported through the returned output, not as an error.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        envs: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Production runner backed by `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        envs: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in envs {
            command.env(key, value);
        }
        // Dropping the output future on timeout must take the child with it.
        command.kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| BackupError::Command {
                status: "timeout".to_string(),
                stderr: format!(
                    "{} did not finish within {}s",
                    program.display(),
                    timeout.as_secs()
                ),
            })?
            .map_err(|e| BackupError::Command {
                status: "spawn failed".to_string(),
                stderr: format!("{}: {}", program.display(), e),
            })?;

        Ok(CommandOutput {
            status_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
