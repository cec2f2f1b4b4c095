//! Manifest schema validation stage.
//!
//! Runs the schema validator against each rendered manifest. Three schema
//! locations are queried in order: the built-in catalog for core kinds, an
//! upstream CRD catalog for common third-party kinds, and a local override
//! directory shipped by the deploying project. First hit wins.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::{
    next_item, send_or_stop, stopped, CheckError, ErrorEnvelope, RenderResult, ValidationResult,
};
use crate::exec::{CommandExecutor, Invocation};

const STAGE: &str = "validate";

/// Upstream catalog of third-party CRD schemas.
const CRD_CATALOG_SCHEMA: &str =
    "https://raw.githubusercontent.com/datreeio/CRDs-catalog/main/{{.Group}}/{{.ResourceKind}}_{{.ResourceAPIVersion}}.json";

/// Project-local schema overrides.
const LOCAL_SCHEMA: &str = "ci/schemas/{{ .ResourceKind }}_{{ .ResourceAPIVersion }}.json";

/// The schema validation stage.
pub(crate) struct ValidateStage {
    executor: Arc<dyn CommandExecutor>,
}

impl ValidateStage {
    pub(crate) fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Starts `worker_count` workers consuming rendered manifests.
    pub(crate) fn spawn(
        self,
        worker_count: usize,
        input: mpsc::Receiver<RenderResult>,
        output: mpsc::Sender<ValidationResult>,
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
        input: Arc<Mutex<mpsc::Receiver<RenderResult>>>,
        output: mpsc::Sender<ValidationResult>,
        errors: mpsc::Sender<ErrorEnvelope>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let Some(rendered) = next_item(&input, &mut stop).await else {
                debug!(stage = STAGE, worker = worker_id, "input channel closed");
                return;
            };
            match self.validate_manifest(&rendered, &mut stop).await {
                Ok(result) => {
                    if !send_or_stop(&output, result, &mut stop).await {
                        return;
                    }
                }
                Err(error) => {
                    warn!(
                        stage = STAGE,
                        worker = worker_id,
                        chart = %rendered.chart.chart_name,
                        manifest = %rendered.manifest_path.display(),
                        error = %error,
                        "manifest validation failed"
                    );
                    let envelope = ErrorEnvelope {
                        chart: rendered.chart,
                        error,
                    };
                    if !send_or_stop(&errors, envelope, &mut stop).await {
                        return;
                    }
                }
            }
        }
    }

    /// Schema-validates one rendered manifest file.
    async fn validate_manifest(
        &self,
        rendered: &RenderResult,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<ValidationResult, CheckError> {
        let manifest = &rendered.manifest_path;
        if !self.executor.file_exists(manifest) {
            return Err(CheckError::InputMissing {
                what: "manifest file",
                path: manifest.display().to_string(),
            });
        }

        let invocation = Invocation::new("kubeconform").args([
            "-strict".to_string(),
            "-summary".to_string(),
            "-schema-location".to_string(),
            "default".to_string(),
            "-schema-location".to_string(),
            CRD_CATALOG_SCHEMA.to_string(),
            "-schema-location".to_string(),
            LOCAL_SCHEMA.to_string(),
            "-verbose".to_string(),
            "-exit-on-error".to_string(),
            manifest.display().to_string(),
        ]);
        debug!(stage = STAGE, command = %invocation.display(), "validating");

        let run = tokio::select! {
            result = self.executor.run(invocation) => result,
            () = stopped(stop) => return Err(CheckError::Cancelled("validating manifest")),
        };
        let outcome = run.map_err(|e| CheckError::ToolFailure {
            tool: "kubeconform",
            detail: format!("{} for {}", e, manifest.display()),
        })?;
        if !outcome.succeeded() {
            return Err(CheckError::ToolFailure {
                tool: "kubeconform",
                detail: format!(
                    "{} for {}; output: {}",
                    outcome.status_label(),
                    manifest.display(),
                    outcome.output.trim()
                ),
            });
        }

        Ok(ValidationResult {
            chart: rendered.chart.clone(),
            manifest_path: manifest.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::super::tests::chart;
    use super::*;
    use crate::exec::mock::MockExecutor;
    use crate::exec::ExecOutput;

    struct Running {
        output: mpsc::Receiver<ValidationResult>,
        errors: mpsc::Receiver<ErrorEnvelope>,
        input: mpsc::Sender<RenderResult>,
        _stop: watch::Sender<bool>,
    }

    fn start_stage(executor: Arc<MockExecutor>) -> Running {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (output_tx, output_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        ValidateStage::new(executor).spawn(2, input_rx, output_tx, error_tx, &stop_rx);
        Running {
            output: output_rx,
            errors: error_rx,
            input: input_tx,
            _stop: stop_tx,
        }
    }

    fn rendered(manifest: &str) -> RenderResult {
        RenderResult {
            chart: chart("frontend"),
            manifest_path: PathBuf::from(manifest),
        }
    }

    #[tokio::test]
    async fn passes_validated_manifests_downstream() {
        let executor = Arc::new(MockExecutor::new());
        let mut running = start_stage(Arc::clone(&executor));

        running
            .input
            .send(rendered("/out/frontend_abc123.yaml"))
            .await
            .unwrap();
        drop(running.input);

        let result = running.output.recv().await.unwrap();
        assert_eq!(result.manifest_path, PathBuf::from("/out/frontend_abc123.yaml"));

        let call = &executor.calls()[0];
        assert_eq!(call.program, "kubeconform");
        assert_eq!(
            call.args,
            vec![
                "-strict",
                "-summary",
                "-schema-location",
                "default",
                "-schema-location",
                CRD_CATALOG_SCHEMA,
                "-schema-location",
                LOCAL_SCHEMA,
                "-verbose",
                "-exit-on-error",
                "/out/frontend_abc123.yaml",
            ]
        );
    }

    #[tokio::test]
    async fn missing_manifest_is_reported_without_running_the_tool() {
        let executor = Arc::new(MockExecutor::new());
        executor.set_file_exists("/out/gone.yaml", false);
        let mut running = start_stage(Arc::clone(&executor));

        running.input.send(rendered("/out/gone.yaml")).await.unwrap();
        drop(running.input);

        let envelope = running.errors.recv().await.unwrap();
        assert!(envelope
            .error
            .to_string()
            .contains("manifest file does not exist"));
        assert_eq!(executor.call_count("kubeconform"), 0);
    }

    #[tokio::test]
    async fn validator_failure_becomes_an_error_envelope() {
        let executor = Arc::new(MockExecutor::new());
        executor.respond_to("kubeconform", |_| {
            Ok(ExecOutput::failure(1, "invalid resource"))
        });
        let mut running = start_stage(executor);

        running
            .input
            .send(rendered("/out/frontend_abc123.yaml"))
            .await
            .unwrap();
        drop(running.input);

        let envelope = running.errors.recv().await.unwrap();
        let message = envelope.error.to_string();
        assert!(message.contains("kubeconform command failed"));
        assert!(message.contains("invalid resource"));
        assert!(running.output.recv().await.is_none());
    }
}
