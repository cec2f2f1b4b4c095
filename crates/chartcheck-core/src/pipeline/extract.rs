//! Image extraction stage.
//!
//! Reads each validated manifest and emits one [`ImageRef`] per unique
//! image found in it. Emitting per image rather than per file lets the
//! verifier parallelize across images and coalesce duplicates across
//! unrelated charts.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::{next_item, send_or_stop, CheckError, ErrorEnvelope, ImageRef, ValidationResult};
use crate::manifest;

const STAGE: &str = "extract";

/// The image extraction stage.
pub(crate) struct ExtractStage;

impl ExtractStage {
    /// Starts `worker_count` workers consuming validated manifests.
    pub(crate) fn spawn(
        self,
        worker_count: usize,
        input: mpsc::Receiver<ValidationResult>,
        output: mpsc::Sender<ImageRef>,
        errors: mpsc::Sender<ErrorEnvelope>,
        stop: &watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let input = Arc::new(Mutex::new(input));
        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(worker(
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
}

async fn worker(
    worker_id: usize,
    input: Arc<Mutex<mpsc::Receiver<ValidationResult>>>,
    output: mpsc::Sender<ImageRef>,
    errors: mpsc::Sender<ErrorEnvelope>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let Some(validated) = next_item(&input, &mut stop).await else {
            debug!(stage = STAGE, worker = worker_id, "input channel closed");
            return;
        };
        let content = match tokio::fs::read_to_string(&validated.manifest_path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    stage = STAGE,
                    worker = worker_id,
                    manifest = %validated.manifest_path.display(),
                    error = %e,
                    "failed to read manifest"
                );
                let envelope = ErrorEnvelope {
                    chart: validated.chart,
                    error: CheckError::Io {
                        context: "failed to read manifest",
                        message: format!("{}: {e}", validated.manifest_path.display()),
                    },
                };
                if !send_or_stop(&errors, envelope, &mut stop).await {
                    return;
                }
                continue;
            }
        };

        let images = manifest::images_in_manifest(&validated.manifest_path, &content);
        debug!(
            stage = STAGE,
            worker = worker_id,
            manifest = %validated.manifest_path.display(),
            count = images.len(),
            "extracted images"
        );
        for image in images {
            let image_ref = ImageRef {
                chart: validated.chart.clone(),
                manifest_path: validated.manifest_path.clone(),
                image,
            };
            if !send_or_stop(&output, image_ref, &mut stop).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::super::tests::chart;
    use super::*;

    struct Running {
        output: mpsc::Receiver<ImageRef>,
        errors: mpsc::Receiver<ErrorEnvelope>,
        input: mpsc::Sender<ValidationResult>,
        _stop: watch::Sender<bool>,
    }

    fn start_stage() -> Running {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (output_tx, output_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        ExtractStage.spawn(2, input_rx, output_tx, error_tx, &stop_rx);
        Running {
            output: output_rx,
            errors: error_rx,
            input: input_tx,
            _stop: stop_tx,
        }
    }

    #[tokio::test]
    async fn emits_one_ref_per_unique_image() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("mixed.yaml");
        std::fs::write(
            &manifest_path,
            "\
kind: Pod
spec:
  containers:
    - image: alpine:3
---
kind: Deployment
spec:
  template:
    spec:
      containers:
        - image: nginx:1
      initContainers:
        - image: busybox:1
---
kind: ConfigMap
data: {}
---
kind: Pod
spec:
  containers:
    - image: alpine:3
",
        )
        .unwrap();

        let mut running = start_stage();
        running
            .input
            .send(ValidationResult {
                chart: chart("frontend"),
                manifest_path: manifest_path.clone(),
            })
            .await
            .unwrap();
        drop(running.input);

        let mut images = Vec::new();
        while let Some(image_ref) = running.output.recv().await {
            assert_eq!(image_ref.manifest_path, manifest_path);
            assert_eq!(image_ref.chart.chart_name, "frontend");
            images.push(image_ref.image);
        }
        assert_eq!(images, vec!["alpine:3", "nginx:1", "busybox:1"]);
    }

    #[tokio::test]
    async fn unreadable_manifest_becomes_an_error_envelope() {
        let mut running = start_stage();
        running
            .input
            .send(ValidationResult {
                chart: chart("frontend"),
                manifest_path: PathBuf::from("/chartcheck-no-such-manifest.yaml"),
            })
            .await
            .unwrap();
        drop(running.input);

        let envelope = running.errors.recv().await.unwrap();
        assert!(matches!(envelope.error, CheckError::Io { .. }));
        assert!(running.output.recv().await.is_none());
    }

    #[tokio::test]
    async fn manifest_without_workloads_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("quiet.yaml");
        std::fs::write(&manifest_path, "kind: ConfigMap\ndata: {}\n").unwrap();

        let mut running = start_stage();
        running
            .input
            .send(ValidationResult {
                chart: chart("quiet"),
                manifest_path,
            })
            .await
            .unwrap();
        drop(running.input);

        assert!(running.output.recv().await.is_none());
    }
}
