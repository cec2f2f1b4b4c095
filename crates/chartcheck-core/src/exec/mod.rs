//! Command execution capability.
//!
//! The pipeline invokes its external tools (template engine, schema
//! validator, registry inspector) through the [`CommandExecutor`] trait so
//! stages can be exercised hermetically in tests. [`SystemExecutor`] is the
//! real implementation; [`mock::MockExecutor`] scripts tool behavior.

pub mod mock;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Errors that can occur while running an external command.
///
/// A tool exiting non-zero is *not* an error at this layer; it is reported
/// through [`ExecOutput`] so callers can attach the captured output to their
/// own diagnostics.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The tool binary could not be started.
    #[error("failed to spawn {tool}: {message}")]
    Spawn {
        /// Tool that failed to start.
        tool: &'static str,
        /// Underlying OS error text.
        message: String,
    },

    /// Waiting for the tool failed.
    #[error("failed waiting for {tool}: {message}")]
    Wait {
        /// Tool that was being awaited.
        tool: &'static str,
        /// Underlying OS error text.
        message: String,
    },

    /// The tool did not finish within its deadline.
    #[error("{tool} timed out after {}s", timeout.as_secs())]
    TimedOut {
        /// Tool that timed out.
        tool: &'static str,
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

/// A single external tool invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Tool binary name, resolved via `PATH`.
    pub program: &'static str,
    /// Arguments, one element per argv entry.
    pub args: Vec<String>,
    /// Optional deadline for the whole invocation.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Creates an invocation of the named tool with no arguments.
    #[must_use]
    pub const fn new(program: &'static str) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets a deadline for the invocation.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The invocation rendered as a shell-like line, for log messages.
    #[must_use]
    pub fn display(&self) -> String {
        let mut line = String::from(self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    /// Creates a successful output with the given combined text.
    #[must_use]
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    /// Creates a failed output with the given exit code and combined text.
    #[must_use]
    pub fn failure(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    /// Returns `true` if the tool exited zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable exit status, e.g. `exit status 1`.
    #[must_use]
    pub fn status_label(&self) -> String {
        self.code.map_or_else(
            || "terminated by signal".to_string(),
            |code| format!("exit status {code}"),
        )
    }
}

/// Capability for invoking external tools and probing the filesystem.
///
/// Implementations must be stateless enough to share across worker tasks.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs the invocation to completion, capturing combined output.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`] if the tool cannot be started, cannot be
    /// awaited, or exceeds its deadline. A non-zero exit is reported via
    /// [`ExecOutput::code`], not as an error.
    async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError>;

    /// Returns `true` if a file or directory exists at `path`.
    fn file_exists(&self, path: &Path) -> bool;
}

/// [`CommandExecutor`] backed by real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError> {
        let tool = invocation.program;
        debug!(command = %invocation.display(), "executing");

        let mut cmd = Command::new(tool);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the in-flight future (cancellation) must not leave
            // the subprocess behind.
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ExecError::Spawn {
            tool,
            message: e.to_string(),
        })?;

        let wait = child.wait_with_output();
        let output = match invocation.timeout {
            Some(deadline) => timeout(deadline, wait)
                .await
                .map_err(|_| ExecError::TimedOut {
                    tool,
                    timeout: deadline,
                })?,
            None => wait.await,
        }
        .map_err(|e| ExecError::Wait {
            tool,
            message: e.to_string(),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutput {
            code: output.status.code(),
            output: combined,
        })
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn run_captures_output_and_exit_code() {
        let invocation = Invocation::new("sh").args(["-c", "echo out; echo err 1>&2"]);
        let result = SystemExecutor.run(invocation).await.unwrap();
        assert!(result.succeeded());
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn run_reports_nonzero_exit_as_output() {
        let invocation = Invocation::new("sh").args(["-c", "exit 3"]);
        let result = SystemExecutor.run(invocation).await.unwrap();
        assert!(!result.succeeded());
        assert_eq!(result.code, Some(3));
        assert_eq!(result.status_label(), "exit status 3");
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn run_times_out_slow_commands() {
        let invocation = Invocation::new("sleep")
            .args(["5"])
            .timeout(Duration::from_millis(50));
        let err = SystemExecutor.run(invocation).await.unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { tool: "sleep", .. }));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn run_rejects_missing_binary() {
        let invocation = Invocation::new("chartcheck-no-such-binary-xyz");
        let err = SystemExecutor.run(invocation).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn file_exists_probes_the_filesystem() {
        assert!(SystemExecutor.file_exists(Path::new("/")));
        assert!(!SystemExecutor.file_exists(Path::new("/chartcheck-no-such-path")));
    }

    #[test]
    fn invocation_display_joins_argv() {
        let invocation = Invocation::new("helm").args(["template", "demo"]);
        assert_eq!(invocation.display(), "helm template demo");
    }
}
