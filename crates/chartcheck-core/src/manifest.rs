//! Kubernetes manifest parsing and image collection.
//!
//! Rendered charts arrive as multi-document YAML. Only the workload kinds
//! that carry pod templates are inspected; everything else is skipped. The
//! projection is deliberately minimal: container and init-container image
//! strings, nothing more.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::CheckError;

/// Separator between documents in a rendered manifest file.
const DOCUMENT_SEPARATOR: &str = "\n---\n";

/// Why a single manifest document could not be inspected.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document is not valid YAML or does not fit the projection.
    #[error("failed to parse YAML: {0}")]
    Parse(String),

    /// The document has no `kind` discriminator.
    #[error("manifest missing 'kind' field")]
    MissingKind,
}

impl From<DocumentError> for CheckError {
    fn from(error: DocumentError) -> Self {
        Self::ParseFailure(error.to_string())
    }
}

/// Minimal projection of a pod-shaped object: `spec.containers[*].image`
/// and `spec.initContainers[*].image`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodLike {
    spec: Option<PodSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodSpec {
    containers: Vec<Container>,
    #[serde(rename = "initContainers")]
    init_containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Container {
    image: Option<String>,
}

/// Workload kinds wrap a pod template under `spec.template`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Workload {
    spec: Option<WorkloadSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkloadSpec {
    template: Option<PodLike>,
}

impl PodLike {
    fn images(self) -> Vec<String> {
        let Some(spec) = self.spec else {
            return Vec::new();
        };
        spec.containers
            .into_iter()
            .chain(spec.init_containers)
            .filter_map(|container| container.image)
            .collect()
    }
}

/// Collects the image references of a single manifest document.
///
/// Pod, Deployment, DaemonSet, and StatefulSet documents are inspected;
/// any other kind yields an empty list.
///
/// # Errors
///
/// Returns [`DocumentError`] when the document is not parseable YAML, has
/// no `kind` field, or its pod section does not fit the projection.
pub fn images_in_document(document: &str) -> Result<Vec<String>, DocumentError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(document).map_err(|e| DocumentError::Parse(e.to_string()))?;

    let Some(kind) = value
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .map(ToOwned::to_owned)
    else {
        return Err(DocumentError::MissingKind);
    };

    match kind.as_str() {
        "Pod" => {
            let pod: PodLike = serde_yaml::from_value(value)
                .map_err(|e| DocumentError::Parse(e.to_string()))?;
            Ok(pod.images())
        }
        "Deployment" | "DaemonSet" | "StatefulSet" => {
            let workload: Workload = serde_yaml::from_value(value)
                .map_err(|e| DocumentError::Parse(e.to_string()))?;
            Ok(workload
                .spec
                .and_then(|spec| spec.template)
                .map(PodLike::images)
                .unwrap_or_default())
        }
        other => {
            debug!(kind = other, "skipping image extraction");
            Ok(Vec::new())
        }
    }
}

/// Collects the unique image references of a multi-document manifest file,
/// in first-occurrence order.
///
/// A document that fails to parse is a warning, not a failure of the file;
/// the remaining documents are still inspected.
#[must_use]
pub fn images_in_manifest(path: &Path, content: &str) -> Vec<String> {
    let mut images = Vec::new();
    for document in content.split(DOCUMENT_SEPARATOR) {
        let document = document.trim();
        if document.is_empty() {
            continue;
        }
        match images_in_document(document) {
            Ok(found) => images.extend(found),
            Err(error) => {
                let error = CheckError::from(error);
                warn!(
                    manifest = %path.display(),
                    error = %error,
                    "skipping unparseable manifest document"
                );
            }
        }
    }
    dedup_preserving_first(images)
}

/// Removes duplicates while preserving first-occurrence order.
fn dedup_preserving_first(images: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    images
        .into_iter()
        .filter(|image| seen.insert(image.clone()))
        .collect()
}
