//! The four-stage chart validation pipeline.
//!
//! Charts flow render → validate → extract → verify through per-stage
//! worker pools connected by typed channels. Each stage owns the closing of
//! its output channel: when the last worker of a stage returns, its sender
//! clones drop and the downstream stage drains to completion. A shared
//! error channel carries per-chart failures to the coordinator, which
//! merges them with the image verdicts into one outcome stream.

mod checker;
mod extract;
mod render;
mod validate;
mod verify;

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;

pub use checker::{ChartChecker, CheckHandle, CheckerError, RenderHandle, RenderOutcome};

/// Capacity of the channels linking pipeline stages. Kept minimal so slower
/// stages pace faster ones; correctness does not depend on buffering.
pub(crate) const STAGE_CHANNEL_CAPACITY: usize = 1;

/// An immutable descriptor of one chart to validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSpec {
    /// Environment the chart was discovered in, for reporting.
    pub env: String,
    /// Chart name within its repository.
    pub chart_name: String,
    /// Upstream chart repository URL.
    pub repo_url: String,
    /// Chart version to render.
    pub chart_version: String,
    /// Base values file; must exist before rendering.
    pub base_values_file: PathBuf,
    /// Environment-specific values override file; must exist before
    /// rendering.
    pub values_override: PathBuf,
}

/// A chart rendered to a manifest file on disk.
#[derive(Debug, Clone)]
pub struct RenderResult {
    /// The chart that was rendered.
    pub chart: ChartSpec,
    /// Absolute path of the rendered multi-document YAML file.
    pub manifest_path: PathBuf,
}

/// A rendered manifest that passed schema validation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// The chart the manifest was rendered from.
    pub chart: ChartSpec,
    /// Path of the validated manifest file.
    pub manifest_path: PathBuf,
}

/// One container image reference found in a validated manifest.
#[derive(Debug, Clone)]
pub struct ImageRef {
    /// The chart the image was extracted for.
    pub chart: ChartSpec,
    /// Manifest file the image was found in.
    pub manifest_path: PathBuf,
    /// Image reference string, e.g. `nginx:1.20`.
    pub image: String,
}

/// Terminal verdict for one (chart, image) pair.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    /// The chart the image belongs to.
    pub chart: ChartSpec,
    /// The image that was inspected.
    pub image: String,
    /// Whether the registry reports the image as present.
    pub exists: bool,
    /// Failure detail when the inspection did not succeed.
    pub error: Option<CheckError>,
}

/// A per-chart failure emitted by any stage.
#[derive(Debug, Clone)]
pub struct ErrorEnvelope {
    /// The chart the failure belongs to.
    pub chart: ChartSpec,
    /// What went wrong.
    pub error: CheckError,
}

/// One terminal record in the merged outcome stream: either an image
/// verdict or a stage failure reported against its chart.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// The chart the outcome belongs to.
    pub chart: ChartSpec,
    /// The image the outcome is about; `None` for failures that occurred
    /// before any image was extracted.
    pub image: Option<String>,
    /// `None` means every check passed for this (chart, image) pair.
    pub error: Option<CheckError>,
}

impl CheckOutcome {
    /// Returns `true` if this outcome represents a passed check.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Failure taxonomy for chart checks.
///
/// Cloneable so the verifier can cache verdicts and hand the same failure
/// to every chart referencing an image.
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    /// A required input file is absent.
    #[error("{what} does not exist: {path}")]
    InputMissing {
        /// What kind of input is missing, e.g. `values override file`.
        what: &'static str,
        /// The path that was checked.
        path: String,
    },

    /// An external tool could not run or exited non-zero.
    #[error("{tool} command failed: {detail}")]
    ToolFailure {
        /// The tool that failed.
        tool: &'static str,
        /// Exit status and captured output, or the execution error.
        detail: String,
    },

    /// A manifest document that could not be parsed. Warned at document
    /// granularity; the rest of the file continues.
    #[error("failed to parse manifest document: {0}")]
    ParseFailure(String),

    /// A filesystem operation failed; fatal for the affected chart.
    #[error("{context}: {message}")]
    Io {
        /// What was being attempted.
        context: &'static str,
        /// Underlying error text.
        message: String,
    },

    /// The registry reports the image as absent.
    #[error("docker image does not exist: {0}")]
    ImageAbsent(String),

    /// Work was abandoned because the pipeline was cancelled.
    #[error("cancelled while {0}")]
    Cancelled(&'static str),
}

/// Resolves when the stop flag flips to `true`.
///
/// A dropped sender means the pipeline owner is gone, which is treated the
/// same as an explicit stop.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|flag| *flag).await;
}

/// Receives the next work item, or `None` once the input channel is closed
/// and drained or the pipeline is stopped.
pub(crate) async fn next_item<T>(
    input: &Mutex<mpsc::Receiver<T>>,
    stop: &mut watch::Receiver<bool>,
) -> Option<T> {
    let mut rx = input.lock().await;
    tokio::select! {
        item = rx.recv() => item,
        () = stopped(stop) => None,
    }
}

/// Sends a value downstream unless the pipeline stops or the receiver is
/// gone first. Returns `false` when the worker should wind down.
pub(crate) async fn send_or_stop<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        sent = tx.send(value) => sent.is_ok(),
        () = stopped(stop) => false,
    }
}
