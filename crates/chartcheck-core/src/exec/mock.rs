//! Scripted command executor for tests.
//!
//! [`MockExecutor`] records every invocation and answers from per-tool
//! handlers, so stage and pipeline tests run without helm, kubeconform, or
//! docker installed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandExecutor, ExecError, ExecOutput, Invocation};

type Handler = dyn Fn(&Invocation) -> Result<ExecOutput, ExecError> + Send + Sync;

/// A recorded tool invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Tool binary name.
    pub program: &'static str,
    /// Arguments as passed.
    pub args: Vec<String>,
}

impl RecordedCall {
    /// The call rendered as a shell-like line.
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

/// [`CommandExecutor`] with scripted behavior.
///
/// Unscripted tools answer with an empty successful output, and unknown
/// paths are reported as existing, so only the interesting behavior has to
/// be set up per test.
#[derive(Default)]
pub struct MockExecutor {
    handlers: Mutex<HashMap<&'static str, Box<Handler>>>,
    latencies: Mutex<HashMap<&'static str, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    file_exists: Mutex<HashMap<PathBuf, bool>>,
}

impl MockExecutor {
    /// Creates an executor where every tool succeeds with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the behavior of one tool.
    pub fn respond_to<F>(&self, program: &'static str, handler: F)
    where
        F: Fn(&Invocation) -> Result<ExecOutput, ExecError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .insert(program, Box::new(handler));
    }

    /// Delays every invocation of a tool, to widen concurrency windows.
    pub fn set_latency(&self, program: &'static str, latency: Duration) {
        self.latencies
            .lock()
            .expect("latency lock poisoned")
            .insert(program, latency);
    }

    /// Overrides the existence answer for one path.
    pub fn set_file_exists(&self, path: impl Into<PathBuf>, exists: bool) {
        self.file_exists
            .lock()
            .expect("file map lock poisoned")
            .insert(path.into(), exists);
    }

    /// All invocations recorded so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("call lock poisoned").clone()
    }

    /// Number of recorded invocations of one tool.
    #[must_use]
    pub fn call_count(&self, program: &str) -> usize {
        self.calls
            .lock()
            .expect("call lock poisoned")
            .iter()
            .filter(|call| call.program == program)
            .count()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError> {
        self.calls
            .lock()
            .expect("call lock poisoned")
            .push(RecordedCall {
                program: invocation.program,
                args: invocation.args.clone(),
            });

        let latency = self
            .latencies
            .lock()
            .expect("latency lock poisoned")
            .get(invocation.program)
            .copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let handlers = self.handlers.lock().expect("handler lock poisoned");
        match handlers.get(invocation.program) {
            Some(handler) => handler(&invocation),
            None => Ok(ExecOutput::success("")),
        }
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.file_exists
            .lock()
            .expect("file map lock poisoned")
            .get(path)
            .copied()
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unscripted_tools_succeed_with_empty_output() {
        let exec = MockExecutor::new();
        let out = exec.run(Invocation::new("helm")).await.unwrap();
        assert!(out.succeeded());
        assert!(out.output.is_empty());
    }

    #[tokio::test]
    async fn handlers_and_call_log_are_per_tool() {
        let exec = MockExecutor::new();
        exec.respond_to("docker", |_| Ok(ExecOutput::failure(1, "no such manifest")));

        let out = exec
            .run(Invocation::new("docker").args(["manifest", "inspect", "a:1"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(1));

        exec.run(Invocation::new("helm")).await.unwrap();
        assert_eq!(exec.call_count("docker"), 1);
        assert_eq!(exec.call_count("helm"), 1);
        assert_eq!(
            exec.calls()[0].display(),
            "docker manifest inspect a:1"
        );
    }

    #[tokio::test]
    async fn file_existence_defaults_to_true() {
        let exec = MockExecutor::new();
        assert!(exec.file_exists(Path::new("/anything")));
        exec.set_file_exists("/missing", false);
        assert!(!exec.file_exists(Path::new("/missing")));
    }
}
