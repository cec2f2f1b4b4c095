//! Run configuration for chart checking.
//!
//! Everything the discoverer and the pipeline need is carried explicitly
//! here; there is no process-global state.

use std::path::PathBuf;

/// Default number of worker tasks per pipeline stage.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default prefix joined onto values-file paths found in appset elements.
pub const DEFAULT_SRC_PREFIX: &str = "../";

/// Configuration for one chart-checking run.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Base directory containing one sub-directory per environment.
    pub env_dir: PathBuf,

    /// Restrict the run to a single environment (sub-directory name).
    /// `None` processes every environment under [`Self::env_dir`].
    pub env: Option<String>,

    /// Directory rendered manifests are written to. Recreated (wiped then
    /// made) when the pipeline starts.
    pub output_dir: PathBuf,

    /// Prefix joined onto the values-file paths referenced by appset
    /// elements before they are used.
    pub src_prefix: String,

    /// Worker tasks per pipeline stage.
    pub worker_count: usize,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            env_dir: PathBuf::from("../env"),
            env: None,
            output_dir: PathBuf::from("manifests"),
            src_prefix: DEFAULT_SRC_PREFIX.to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }
}

impl CheckConfig {
    /// Creates a configuration with default paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the environment base directory.
    #[must_use]
    pub fn with_env_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.env_dir = dir.into();
        self
    }

    /// Restricts the run to one environment.
    #[must_use]
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    /// Sets the output directory for rendered manifests.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the worker count per stage.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }
}
