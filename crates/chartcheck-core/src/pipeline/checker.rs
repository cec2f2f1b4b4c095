//! Pipeline coordinator.
//!
//! Constructs the four stages with connected channels, starts their worker
//! pools, and exposes a single merged outcome stream. The shutdown cascade
//! is driven entirely by channel closure: the caller drops the input
//! sender, each stage's output closes when its last worker returns, and the
//! outcome stream closes once the final stage *and* the shared error
//! channel have both drained.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::extract::ExtractStage;
use super::render::RenderStage;
use super::validate::ValidateStage;
use super::verify::VerifyStage;
use super::{
    ChartSpec, CheckError, CheckOutcome, ErrorEnvelope, RenderResult, STAGE_CHANNEL_CAPACITY,
};
use crate::config::DEFAULT_WORKER_COUNT;
use crate::exec::CommandExecutor;

/// Errors raised while starting a pipeline.
#[derive(Debug, Error)]
pub enum CheckerError {
    /// The output directory could not be recreated.
    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        /// The directory that failed.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Builder and entry point for the validation pipeline.
pub struct ChartChecker {
    executor: Arc<dyn CommandExecutor>,
    output_dir: PathBuf,
    worker_count: usize,
}

impl ChartChecker {
    /// Creates a checker writing rendered manifests under `output_dir`.
    pub fn new(executor: Arc<dyn CommandExecutor>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            output_dir: output_dir.into(),
            worker_count: DEFAULT_WORKER_COUNT,
        }
    }

    /// Overrides the number of worker tasks per stage.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Starts the full pipeline.
    ///
    /// Returns the handle carrying the outcome stream and the input sender.
    /// Submit every [`ChartSpec`] on the sender, then drop it (and all
    /// clones); the outcome stream ends once all submitted work has reached
    /// a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError`] if the output directory cannot be
    /// recreated.
    pub fn start(self) -> Result<(CheckHandle, mpsc::Sender<ChartSpec>), CheckerError> {
        let output_dir = prepare_output_dir(&self.output_dir)?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let (input_tx, input_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (render_tx, render_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (validate_tx, validate_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (extract_tx, extract_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (verify_tx, mut verify_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (error_tx, mut error_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        RenderStage::new(Arc::clone(&self.executor), output_dir).spawn(
            self.worker_count,
            input_rx,
            render_tx,
            error_tx.clone(),
            &stop_rx,
        );
        ValidateStage::new(Arc::clone(&self.executor)).spawn(
            self.worker_count,
            render_rx,
            validate_tx,
            error_tx.clone(),
            &stop_rx,
        );
        ExtractStage.spawn(
            self.worker_count,
            validate_rx,
            extract_tx,
            error_tx.clone(),
            &stop_rx,
        );
        VerifyStage::new(Arc::clone(&self.executor)).spawn(
            self.worker_count,
            extract_rx,
            verify_tx,
            &stop_rx,
        );
        drop(error_tx);

        // Merge image verdicts and per-chart failures into one stream. The
        // outcome channel closes only after both sources have drained.
        tokio::spawn(async move {
            let mut verifying = true;
            let mut erroring = true;
            while verifying || erroring {
                let outcome = tokio::select! {
                    result = verify_rx.recv(), if verifying => match result {
                        Some(result) => {
                            let error = match result.error {
                                Some(error) => Some(error),
                                None if !result.exists => {
                                    Some(CheckError::ImageAbsent(result.image.clone()))
                                }
                                None => None,
                            };
                            CheckOutcome {
                                chart: result.chart,
                                image: Some(result.image),
                                error,
                            }
                        }
                        None => {
                            verifying = false;
                            continue;
                        }
                    },
                    envelope = error_rx.recv(), if erroring => match envelope {
                        Some(ErrorEnvelope { chart, error }) => CheckOutcome {
                            chart,
                            image: None,
                            error: Some(error),
                        },
                        None => {
                            erroring = false;
                            continue;
                        }
                    },
                };
                if outcome_tx.send(outcome).await.is_err() {
                    // The caller stopped listening; let the stages wind
                    // down through the stop signal or channel closure.
                    return;
                }
            }
            debug!("all stages drained; closing outcome stream");
        });

        let handle = CheckHandle {
            outcomes: outcome_rx,
            stop: stop_tx,
        };
        Ok((handle, input_tx))
    }

    /// Starts only the rendering stage, for runs that materialize manifests
    /// without validating them.
    ///
    /// # Errors
    ///
    /// Returns [`CheckerError`] if the output directory cannot be
    /// recreated.
    pub fn start_render_only(
        self,
    ) -> Result<(RenderHandle, mpsc::Sender<ChartSpec>), CheckerError> {
        let output_dir = prepare_output_dir(&self.output_dir)?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let (input_tx, input_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (render_tx, mut render_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (error_tx, mut error_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (outcome_tx, outcome_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        RenderStage::new(Arc::clone(&self.executor), output_dir).spawn(
            self.worker_count,
            input_rx,
            render_tx,
            error_tx,
            &stop_rx,
        );

        tokio::spawn(async move {
            let mut rendering = true;
            let mut erroring = true;
            while rendering || erroring {
                let outcome = tokio::select! {
                    result = render_rx.recv(), if rendering => match result {
                        Some(RenderResult { chart, manifest_path }) => RenderOutcome {
                            chart,
                            manifest_path: Some(manifest_path),
                            error: None,
                        },
                        None => {
                            rendering = false;
                            continue;
                        }
                    },
                    envelope = error_rx.recv(), if erroring => match envelope {
                        Some(ErrorEnvelope { chart, error }) => RenderOutcome {
                            chart,
                            manifest_path: None,
                            error: Some(error),
                        },
                        None => {
                            erroring = false;
                            continue;
                        }
                    },
                };
                if outcome_tx.send(outcome).await.is_err() {
                    return;
                }
            }
            debug!("renderer drained; closing outcome stream");
        });

        let handle = RenderHandle {
            outcomes: outcome_rx,
            stop: stop_tx,
        };
        Ok((handle, input_tx))
    }
}

/// Handle to a running validation pipeline.
pub struct CheckHandle {
    outcomes: mpsc::Receiver<CheckOutcome>,
    stop: watch::Sender<bool>,
}

impl CheckHandle {
    /// Receives the next terminal outcome, or `None` once the pipeline has
    /// drained.
    pub async fn next_outcome(&mut self) -> Option<CheckOutcome> {
        self.outcomes.recv().await
    }

    /// Cancels the pipeline. Workers return at their next suspension point
    /// and in-flight tool invocations are killed; the outcome stream still
    /// terminates through the normal cascade.
    pub fn cancel(&self) {
        info!("cancelling pipeline");
        let _ = self.stop.send(true);
    }
}

/// Terminal record of a render-only run.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    /// The chart the outcome belongs to.
    pub chart: ChartSpec,
    /// Where the manifest was written, on success.
    pub manifest_path: Option<PathBuf>,
    /// What went wrong, on failure.
    pub error: Option<CheckError>,
}

/// Handle to a running render-only pipeline.
pub struct RenderHandle {
    outcomes: mpsc::Receiver<RenderOutcome>,
    stop: watch::Sender<bool>,
}

impl RenderHandle {
    /// Receives the next render outcome, or `None` once the renderer has
    /// drained.
    pub async fn next_outcome(&mut self) -> Option<RenderOutcome> {
        self.outcomes.recv().await
    }

    /// Cancels the run.
    pub fn cancel(&self) {
        info!("cancelling render run");
        let _ = self.stop.send(true);
    }
}

/// Wipes and recreates the output directory, returning its absolute path.
/// Isolates runs from one another: no stale manifest survives a restart.
fn prepare_output_dir(dir: &Path) -> Result<PathBuf, CheckerError> {
    let absolute = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| CheckerError::OutputDir {
                path: dir.display().to_string(),
                source,
            })?
            .join(dir)
    };

    match std::fs::remove_dir_all(&absolute) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(CheckerError::OutputDir {
                path: absolute.display().to_string(),
                source,
            });
        }
    }
    std::fs::create_dir_all(&absolute).map_err(|source| CheckerError::OutputDir {
        path: absolute.display().to_string(),
        source,
    })?;
    Ok(absolute)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::super::tests::chart;
    use super::*;
    use crate::exec::mock::MockExecutor;

    #[tokio::test]
    async fn empty_input_closes_the_outcome_stream() {
        let dir = tempfile::tempdir().unwrap();
        let checker = ChartChecker::new(Arc::new(MockExecutor::new()), dir.path().join("out"))
            .with_worker_count(2);
        let (mut handle, input) = checker.start().unwrap();
        drop(input);

        let next = timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .expect("outcome stream should close promptly");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn stage_failures_surface_as_outcomes_without_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new());
        executor.set_file_exists("../values/override.yaml", false);

        let checker =
            ChartChecker::new(executor, dir.path().join("out")).with_worker_count(2);
        let (mut handle, input) = checker.start().unwrap();
        input.send(chart("frontend")).await.unwrap();
        drop(input);

        let outcome = timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .unwrap()
            .expect("the failure must not be dropped");
        assert_eq!(outcome.chart.chart_name, "frontend");
        assert!(outcome.image.is_none());
        assert!(!outcome.passed());
        assert!(timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn render_only_empty_input_closes_the_outcome_stream() {
        let dir = tempfile::tempdir().unwrap();
        let checker = ChartChecker::new(Arc::new(MockExecutor::new()), dir.path().join("out"))
            .with_worker_count(2);
        let (mut handle, input) = checker.start_render_only().unwrap();
        drop(input);

        let next = timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .expect("render stream should close promptly");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn render_only_success_reports_the_manifest_path() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new());
        executor.respond_to("helm", |_| {
            Ok(crate::exec::ExecOutput::success(
                "kind: Pod\nspec:\n  containers:\n    - image: alpine:3\n",
            ))
        });

        let checker =
            ChartChecker::new(executor, dir.path().join("out")).with_worker_count(2);
        let (mut handle, input) = checker.start_render_only().unwrap();
        input.send(chart("frontend")).await.unwrap();
        drop(input);

        let outcome = timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .unwrap()
            .expect("one render outcome expected");
        assert_eq!(outcome.chart.chart_name, "frontend");
        assert!(outcome.error.is_none());
        let manifest_path = outcome.manifest_path.expect("successful render has a path");
        assert!(manifest_path.is_file());
        assert!(timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn render_only_failure_surfaces_without_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(MockExecutor::new());
        executor.set_file_exists("../values/override.yaml", false);

        let checker =
            ChartChecker::new(executor, dir.path().join("out")).with_worker_count(2);
        let (mut handle, input) = checker.start_render_only().unwrap();
        input.send(chart("frontend")).await.unwrap();
        drop(input);

        let outcome = timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .unwrap()
            .expect("the failure must not be dropped");
        assert!(outcome.manifest_path.is_none());
        assert!(outcome
            .error
            .unwrap()
            .to_string()
            .contains("values override file does not exist"));
        assert!(timeout(Duration::from_secs(5), handle.next_outcome())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn output_directory_is_recreated_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("stale.yaml"), "old").unwrap();

        let checker = ChartChecker::new(Arc::new(MockExecutor::new()), &out);
        let (_handle, input) = checker.start().unwrap();
        drop(input);

        assert!(out.is_dir());
        assert!(!out.join("stale.yaml").exists());
    }
}
