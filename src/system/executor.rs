//! Subprocess executor.
//! `smartctl` and `ipmitool` are black-box text interfaces; everything that
//! shells out goes through the CommandRunner trait so tests can inject
//! canned transcripts.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

/// Hard cap on subprocess runtime so a hung ipmitool cannot stall the loop.
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the process exited with status 0.
    pub status_ok: bool,
    /// stdout followed by stderr (combined output).
    pub output: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing combined stdout/stderr.
    /// Err means the process could not run at all (spawn failure, timeout);
    /// a non-zero exit is reported through `status_ok`.
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Production runner backed by tokio::process.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        trace!("executing: {} {}", program, args.join(" "));

        let result = tokio::time::timeout(
            SUBPROCESS_TIMEOUT,
            Command::new(program).args(args).output(),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", program, SUBPROCESS_TIMEOUT),
            )
        })??;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        Ok(CommandOutput {
            status_ok: result.status.success(),
            output,
        })
    }
}
