//! Chart rendering stage.
//!
//! Expands each chart with its values files into a multi-document manifest
//! file under the pipeline's output directory. Both values files are
//! checked up front because the template tool's own error for a missing
//! file is opaque.

use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::{next_item, send_or_stop, stopped, ChartSpec, CheckError, ErrorEnvelope, RenderResult};
use crate::exec::{CommandExecutor, Invocation};

const STAGE: &str = "render";

/// Length of the random filename suffix guarding against charts that share
/// a name.
const SUFFIX_LEN: usize = 6;

/// The rendering stage: one pool of workers expanding charts to disk.
pub(crate) struct RenderStage {
    executor: Arc<dyn CommandExecutor>,
    /// Absolute directory rendered manifests are written to. Created by the
    /// coordinator before any worker starts.
    output_dir: PathBuf,
}

impl RenderStage {
    pub(crate) fn new(executor: Arc<dyn CommandExecutor>, output_dir: PathBuf) -> Self {
        Self {
            executor,
            output_dir,
        }
    }

    /// Starts `worker_count` workers consuming `input`. The returned handle
    /// resolves once every worker has finished, at which point the output
    /// channel is closed.
    pub(crate) fn spawn(
        self,
        worker_count: usize,
        input: mpsc::Receiver<ChartSpec>,
        output: mpsc::Sender<RenderResult>,
        errors: mpsc::Sender<ErrorEnvelope>,
        stop: &watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let stage = Arc::new(self);
        let input = Arc::new(Mutex::new(input));
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(Arc::clone(&stage).worker(
                worker_id,
                Arc::clone(&input),
                output.clone(),
                errors.clone(),
                stop.clone(),
            ));
        }
        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
            debug!(stage = STAGE, "all workers finished; output channel closed");
        })
    }

    async fn worker(
        self: Arc<Self>,
        worker_id: usize,
        input: Arc<Mutex<mpsc::Receiver<ChartSpec>>>,
        output: mpsc::Sender<RenderResult>,
        errors: mpsc::Sender<ErrorEnvelope>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let Some(chart) = next_item(&input, &mut stop).await else {
                debug!(stage = STAGE, worker = worker_id, "input channel closed");
                return;
            };
            match self.render_chart(&chart, &mut stop).await {
                Ok(result) => {
                    if !send_or_stop(&output, result, &mut stop).await {
                        return;
                    }
                }
                Err(error) => {
                    warn!(
                        stage = STAGE,
                        worker = worker_id,
                        chart = %chart.chart_name,
                        env = %chart.env,
                        error = %error,
                        "chart render failed"
                    );
                    let envelope = ErrorEnvelope { chart, error };
                    if !send_or_stop(&errors, envelope, &mut stop).await {
                        return;
                    }
                }
            }
        }
    }

    /// Renders one chart and writes the captured output to a uniquely named
    /// manifest file.
    async fn render_chart(
        &self,
        chart: &ChartSpec,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<RenderResult, CheckError> {
        if !self.executor.file_exists(&chart.base_values_file) {
            return Err(CheckError::InputMissing {
                what: "base values file",
                path: chart.base_values_file.display().to_string(),
            });
        }
        if !self.executor.file_exists(&chart.values_override) {
            return Err(CheckError::InputMissing {
                what: "values override file",
                path: chart.values_override.display().to_string(),
            });
        }

        let invocation = Invocation::new("helm").args([
            "template".to_string(),
            chart.chart_name.clone(),
            "--release-name".to_string(),
            chart.chart_name.clone(),
            "--repo".to_string(),
            chart.repo_url.clone(),
            "-f".to_string(),
            chart.base_values_file.display().to_string(),
            "-f".to_string(),
            chart.values_override.display().to_string(),
            "--version".to_string(),
            chart.chart_version.clone(),
            "--include-crds".to_string(),
        ]);
        debug!(stage = STAGE, command = %invocation.display(), "rendering");

        let run = tokio::select! {
            result = self.executor.run(invocation) => result,
            () = stopped(stop) => return Err(CheckError::Cancelled("rendering chart")),
        };
        let rendered = run.map_err(|e| CheckError::ToolFailure {
            tool: "helm",
            detail: e.to_string(),
        })?;
        if !rendered.succeeded() {
            return Err(CheckError::ToolFailure {
                tool: "helm",
                detail: format!("{}; output: {}", rendered.status_label(), rendered.output.trim()),
            });
        }

        let filename = format!("{}_{}.yaml", chart.chart_name, random_suffix(SUFFIX_LEN));
        let manifest_path = self.output_dir.join(filename);
        tokio::fs::write(&manifest_path, rendered.output)
            .await
            .map_err(|e| CheckError::Io {
                context: "failed to write rendered manifest",
                message: e.to_string(),
            })?;

        Ok(RenderResult {
            chart: chart.clone(),
            manifest_path,
        })
    }
}

/// A short alphanumeric suffix; keeps same-named charts from colliding
/// within one run.
fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
