//! # chartcheck-core
//!
//! Core library for chartcheck - a pre-deploy validator for fleets of
//! declarative cluster-application descriptors.
//!
//! For every environment, chartcheck discovers the charts referenced by
//! ApplicationSet documents, renders each chart into concrete Kubernetes
//! objects, schema-validates the rendered manifests, extracts container
//! image references, and confirms each image exists in its registry. The
//! goal is to catch bad values, invalid schemas, and missing images before
//! they reach a cluster.
//!
//! ## Architecture
//!
//! The work runs through a four-stage concurrent pipeline, each stage a
//! pool of worker tasks connected by typed channels:
//!
//! 1. **Render** - expand chart + values into a manifest file on disk
//! 2. **Validate** - schema-check the rendered manifest
//! 3. **Extract** - collect container image references per manifest
//! 4. **Verify** - confirm each image exists, deduplicated across charts
//!
//! A coordinator wires the stages together and merges per-chart failures
//! with the terminal image verdicts into a single outcome stream.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chartcheck_core::exec::SystemExecutor;
//! use chartcheck_core::pipeline::ChartChecker;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let checker = ChartChecker::new(Arc::new(SystemExecutor), "manifests");
//! let (mut handle, input) = checker.start()?;
//! drop(input); // no charts submitted
//! assert!(handle.next_outcome().await.is_none());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod appset;
pub mod config;
pub mod exec;
pub mod manifest;
pub mod pipeline;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::CheckConfig;
    pub use crate::exec::{CommandExecutor, SystemExecutor};
    pub use crate::pipeline::{ChartChecker, ChartSpec, CheckError, CheckOutcome};
}

/// Re-export commonly used types at the crate root.
pub use config::CheckConfig;
pub use pipeline::{ChartChecker, ChartSpec, CheckError, CheckOutcome};
