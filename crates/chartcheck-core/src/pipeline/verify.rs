//! Image verification stage.
//!
//! Confirms each extracted image exists in its registry. The inspection is
//! the most expensive step in the pipeline, so verdicts are deduplicated
//! across charts: for any image string the registry is consulted once, and
//! every chart referencing it observes the same verdict.
//!
//! The dedup protocol is single-flight over two maps behind one
//! reader/writer lock. The first worker to see an image becomes its leader:
//! it parks a `watch` receiver in `pending`, runs the inspection with no
//! lock held, writes the verdict into `cache`, removes the `pending` entry,
//! and signals. Late arrivals either hit `cache` directly or wait on the
//! parked receiver and re-read `cache` after waking. A leader that fails or
//! is cancelled still resolves its verdict, so no waiter hangs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::{next_item, send_or_stop, stopped, CheckError, ImageRef, VerifyResult};
use crate::exec::{CommandExecutor, Invocation};

const STAGE: &str = "verify";

/// Deadline for a single registry inspection.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(120);

/// A cached verdict, shared by every chart referencing the image.
#[derive(Debug, Clone)]
struct ImageVerdict {
    exists: bool,
    error: Option<CheckError>,
}

/// Dedup state: completed verdicts and in-flight inspections.
#[derive(Default)]
struct DedupState {
    cache: HashMap<String, ImageVerdict>,
    pending: HashMap<String, watch::Receiver<bool>>,
}

/// The image verification stage.
pub(crate) struct VerifyStage {
    executor: Arc<dyn CommandExecutor>,
    dedup: RwLock<DedupState>,
}

impl VerifyStage {
    pub(crate) fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            dedup: RwLock::new(DedupState::default()),
        }
    }

    /// Starts `worker_count` workers consuming image references.
    pub(crate) fn spawn(
        self,
        worker_count: usize,
        input: mpsc::Receiver<ImageRef>,
        output: mpsc::Sender<VerifyResult>,
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
        input: Arc<Mutex<mpsc::Receiver<ImageRef>>>,
        output: mpsc::Sender<VerifyResult>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let Some(image_ref) = next_item(&input, &mut stop).await else {
                debug!(stage = STAGE, worker = worker_id, "input channel closed");
                return;
            };
            let verdict = self.verdict_for(&image_ref.image, worker_id, &mut stop).await;
            let result = VerifyResult {
                chart: image_ref.chart,
                image: image_ref.image,
                exists: verdict.exists,
                error: verdict.error,
            };
            if !send_or_stop(&output, result, &mut stop).await {
                return;
            }
        }
    }

    /// Returns the verdict for an image, inspecting the registry at most
    /// once per image string.
    async fn verdict_for(
        &self,
        image: &str,
        worker_id: usize,
        stop: &mut watch::Receiver<bool>,
    ) -> ImageVerdict {
        loop {
            // Fast path under the read lock: a finished verdict, or an
            // in-flight leader to wait on.
            let waiter = {
                let state = self.dedup.read().await;
                if let Some(verdict) = state.cache.get(image) {
                    return verdict.clone();
                }
                state.pending.get(image).cloned()
            };
            if let Some(mut done) = waiter {
                debug!(stage = STAGE, worker = worker_id, image, "waiting for in-flight verdict");
                // A dropped sender also wakes us; the re-read below decides
                // whether the verdict landed.
                let _ = done.wait_for(|finished| *finished).await;
                continue;
            }

            // Leader election under the write lock, double-checking against
            // racing workers.
            let signal = {
                let mut state = self.dedup.write().await;
                if state.cache.contains_key(image) || state.pending.contains_key(image) {
                    continue;
                }
                let (signal, done) = watch::channel(false);
                state.pending.insert(image.to_string(), done);
                signal
            };

            // The slow call runs outside any lock.
            let verdict = self.inspect(image, worker_id, stop).await;

            {
                let mut state = self.dedup.write().await;
                state.cache.insert(image.to_string(), verdict.clone());
                state.pending.remove(image);
            }
            let _ = signal.send(true);
            return verdict;
        }
    }

    /// Runs the registry inspection for one image.
    async fn inspect(
        &self,
        image: &str,
        worker_id: usize,
        stop: &mut watch::Receiver<bool>,
    ) -> ImageVerdict {
        let invocation = Invocation::new("docker")
            .args(["manifest".to_string(), "inspect".to_string(), image.to_string()])
            .timeout(INSPECT_TIMEOUT);
        debug!(stage = STAGE, worker = worker_id, command = %invocation.display(), "inspecting");

        let run = tokio::select! {
            result = self.executor.run(invocation) => result,
            () = stopped(stop) => {
                return ImageVerdict {
                    exists: false,
                    error: Some(CheckError::Cancelled("inspecting image")),
                };
            }
        };
        match run {
            Ok(outcome) if outcome.succeeded() => ImageVerdict {
                exists: true,
                error: None,
            },
            Ok(outcome) => {
                warn!(
                    stage = STAGE,
                    worker = worker_id,
                    image,
                    status = %outcome.status_label(),
                    "image not found in registry"
                );
                ImageVerdict {
                    exists: false,
                    error: Some(CheckError::ImageAbsent(image.to_string())),
                }
            }
            Err(e) => {
                warn!(stage = STAGE, worker = worker_id, image, error = %e, "inspection failed");
                ImageVerdict {
                    exists: false,
                    error: Some(CheckError::ToolFailure {
                        tool: "docker",
                        detail: e.to_string(),
                    }),
                }
            }
        }
    }
}
