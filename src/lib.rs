//! # Overlay Engine
//!
//! Pairwise geometric overlay for GIS analysis tools. Given a target layer and a
//! mask layer, the engine evaluates every `(target, mask)` feature pair under an
//! overlay operation (intersection or erase/difference) on a pool of isolated
//! workers, and aggregates the per-pair results into one result set.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use overlay_engine::config::EngineConfig;
//! use overlay_engine::feature::{Feature, FeatureSet};
//! use overlay_engine::job::{JobController, JobOutcome, JobRequest};
//! use geo::{polygon, Geometry};
//!
//! # async fn example() -> overlay_engine::Result<()> {
//! let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
//! let targets = FeatureSet::from(vec![Feature::new("parcel-1", Geometry::Polygon(square.clone()))]);
//! let masks = FeatureSet::from(vec![Feature::new("flood-1", Geometry::Polygon(square))]);
//!
//! let controller = JobController::new(EngineConfig::default());
//! let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let handle = controller.submit(JobRequest::new(targets, masks, "intersection", "parcels", "flood"), events)?;
//!
//! if let JobOutcome::Completed(done) = handle.wait().await? {
//!     println!("{} results, {} skipped", done.results.len(), done.skipped_pairs);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`overlay`]: the per-pair overlay computation
//! - [`batch`]: batch planning, worker pool, retry policy, aggregation and progress
//! - [`job`]: job requests, the job state machine and the controller
//! - [`feature`]: features and feature sets
//! - [`config`], [`telemetry`], [`metrics`]: ambient configuration and observability

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for overlay engine operations
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Main error type for the overlay engine
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Job rejected before planning
    #[error("Job submission error: {0}")]
    Submission(#[from] job::SubmissionError),

    /// Worker-level failure that could not be absorbed
    #[error("Batch infrastructure error: {0}")]
    Infrastructure(#[from] batch::BatchInfrastructureError),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine configuration
pub mod config;

/// Tracing subscriber setup
pub mod telemetry;

/// Prometheus metrics
pub mod metrics;

/// Features and feature sets
pub mod feature;

/// Per-pair overlay computation
pub mod overlay;

/// Batch planning, dispatch and aggregation
pub mod batch;

/// Job lifecycle
pub mod job;

pub use config::EngineConfig;
pub use feature::{Feature, FeatureSet};
pub use job::{JobController, JobEvent, JobHandle, JobOutcome, JobRequest, JobState};
pub use overlay::{GeometryOverlay, Operation, OverlayComputer};
