//! Batch data types shared by the planner, workers and aggregator

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geo::Geometry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::feature::FeatureSet;
use crate::overlay::Operation;

/// One cell of the target × mask cross-product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairIndex {
    /// Position in the target layer
    pub target_index: usize,
    /// Position in the mask layer
    pub mask_index: usize,
}

impl PairIndex {
    /// Pair of `target_index` and `mask_index`
    pub fn new(target_index: usize, mask_index: usize) -> Self {
        Self {
            target_index,
            mask_index,
        }
    }
}

/// Batch identifier, sequential within a job in planning order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub usize);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Contiguous rectangle of the pair space produced by the planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpan {
    /// Position in planning order
    pub id: BatchId,
    /// Target indices covered
    pub targets: Range<usize>,
    /// Mask indices covered
    pub masks: Range<usize>,
}

impl BatchSpan {
    /// Number of pairs covered
    pub fn pair_count(&self) -> u64 {
        (self.targets.len() as u64) * (self.masks.len() as u64)
    }

    /// Pairs in row-major order (target first)
    pub fn pairs(&self) -> impl Iterator<Item = PairIndex> + '_ {
        self.targets
            .clone()
            .flat_map(move |t| self.masks.clone().map(move |m| PairIndex::new(t, m)))
    }
}

/// Read-only inputs shared by every batch of a job
#[derive(Debug)]
pub struct JobInputs {
    /// Target layer features
    pub targets: FeatureSet,
    /// Mask layer features
    pub masks: FeatureSet,
    /// Operation applied to every pair
    pub operation: Operation,
    /// Target layer name, copied into provenance
    pub target_layer: String,
    /// Mask layer name, copied into provenance
    pub mask_layer: String,
}

/// Unit of work handed to a worker: a span plus a shared view of the inputs
#[derive(Debug, Clone)]
pub struct Batch {
    /// Pairs to evaluate
    pub span: BatchSpan,
    /// Inputs the span indexes into
    pub inputs: Arc<JobInputs>,
}

impl Batch {
    /// Batch over `span` of `inputs`
    pub fn new(span: BatchSpan, inputs: Arc<JobInputs>) -> Self {
        Self { span, inputs }
    }

    /// Id of the underlying span
    pub fn id(&self) -> BatchId {
        self.span.id
    }
}

/// Where a result item came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Position of the target feature in its layer
    pub target_index: usize,
    /// Position of the mask feature in its layer
    pub mask_index: usize,
    /// Id of the target feature
    pub target_feature_id: String,
    /// Id of the mask feature
    pub mask_feature_id: String,
    /// Name of the target layer
    pub target_layer: String,
    /// Name of the mask layer
    pub mask_layer: String,
}

impl Provenance {
    /// The pair this item came from, also its sort key
    pub fn pair(&self) -> PairIndex {
        PairIndex::new(self.target_index, self.mask_index)
    }
}

/// Overlay geometry produced by exactly one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayResultItem {
    /// Unique id, `<operation>_<target>_<mask>_<uuid>`
    pub id: String,
    /// Display label, assigned once the job is aggregated
    pub name: Option<String>,
    /// Overlay of the two input geometries
    pub geometry: Geometry<f64>,
    /// Source pair
    pub provenance: Provenance,
    /// When the pair was evaluated
    pub created_at: DateTime<Utc>,
}

impl OverlayResultItem {
    /// New item with an id of the form `<operation>_<target>_<mask>_<uuid>`
    pub fn new(operation: Operation, geometry: Geometry<f64>, provenance: Provenance) -> Self {
        Self {
            id: format!(
                "{}_{}_{}_{}",
                operation.as_str(),
                provenance.target_index,
                provenance.mask_index,
                Uuid::new_v4().simple()
            ),
            name: None,
            geometry,
            provenance,
            created_at: Utc::now(),
        }
    }
}

/// Worker-level failure of a whole batch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchInfrastructureError {
    /// The computation panicked or its task was lost
    #[error("worker {worker} crashed: {message}")]
    WorkerCrashed {
        /// Worker that ran the batch
        worker: usize,
        /// Panic payload or join error text
        message: String,
    },

    /// The batch ran past the configured timeout
    #[error("batch timed out after {elapsed:?}")]
    TimedOut {
        /// Time since the worker picked the batch up
        elapsed: Duration,
    },

    /// No worker could take the batch
    #[error("no live workers left in the pool")]
    NoWorkers,
}

/// Reply for one batch
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Batch this reply is for
    pub batch_id: BatchId,
    /// At most one item per pair
    pub items: Vec<OverlayResultItem>,
    /// Pairs accounted for by this batch, including ones that yielded nothing
    pub processed_pairs: u64,
    /// Evaluated pairs with no result item
    pub skipped_pairs: u64,
    /// Subset of `skipped_pairs` rejected by the computer as invalid
    pub invalid_pairs: u64,
    /// Set when the batch failed permanently; its pairs still count as processed
    pub error: Option<BatchInfrastructureError>,
    /// Worker time spent on the batch
    pub duration: Duration,
}

impl BatchResult {
    /// Accounting entry for a batch that exhausted its attempts
    pub fn permanently_failed(span: &BatchSpan, error: BatchInfrastructureError) -> Self {
        Self {
            batch_id: span.id,
            items: Vec::new(),
            processed_pairs: span.pair_count(),
            skipped_pairs: 0,
            invalid_pairs: 0,
            error: Some(error),
            duration: Duration::ZERO,
        }
    }

    /// Whether this is a permanent-failure entry
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}
