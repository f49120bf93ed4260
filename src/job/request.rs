//! Job submission and validation

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{BatchPlanner, JobInputs, PlanningError};
use crate::feature::FeatureSet;
use crate::overlay::Operation;

/// Reasons a job is rejected before planning
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmissionError {
    /// Operation name is not `intersection` or `difference`
    #[error("unsupported operation '{0}'")]
    UnsupportedOperation(String),

    /// A layer name is blank
    #[error("{0} layer name must not be empty")]
    EmptyLayerName(&'static str),

    /// `batch_size_hint` of zero
    #[error("batch size hint must be at least one pair")]
    InvalidBatchSize,

    /// A feature cannot be used as input
    #[error("{layer} feature {index} is malformed: {reason}")]
    MalformedFeature {
        /// Layer name
        layer: String,
        /// Position of the feature in its set
        index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// Two features in one set share an id
    #[error("{layer} contains duplicate feature id '{id}'")]
    DuplicateFeatureId {
        /// Layer name
        layer: String,
        /// Repeated id
        id: String,
    },

    /// `target_count * mask_count` does not fit the index space
    #[error("pair space {target_count} x {mask_count} is too large")]
    PairSpaceOverflow {
        /// Target features submitted
        target_count: usize,
        /// Mask features submitted
        mask_count: usize,
    },
}

impl From<PlanningError> for SubmissionError {
    fn from(error: PlanningError) -> Self {
        match error {
            PlanningError::ZeroBatchSize => Self::InvalidBatchSize,
            PlanningError::PairSpaceOverflow {
                target_count,
                mask_count,
            } => Self::PairSpaceOverflow {
                target_count,
                mask_count,
            },
        }
    }
}

/// Overlay job as submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Features overlaid by the mask
    pub target_features: FeatureSet,
    /// Features applied to every target
    pub mask_features: FeatureSet,
    /// `"intersection"` or `"difference"` (`"intersect"` / `"erase"` are accepted too)
    pub operation: String,
    /// Recorded in result provenance
    pub target_layer_name: String,
    /// Recorded in result provenance
    pub mask_layer_name: String,
    /// Maximum pairs per batch; derived from the pool size when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size_hint: Option<usize>,
}

impl JobRequest {
    /// Request without a batch size hint
    pub fn new(
        target_features: FeatureSet,
        mask_features: FeatureSet,
        operation: impl Into<String>,
        target_layer_name: impl Into<String>,
        mask_layer_name: impl Into<String>,
    ) -> Self {
        Self {
            target_features,
            mask_features,
            operation: operation.into(),
            target_layer_name: target_layer_name.into(),
            mask_layer_name: mask_layer_name.into(),
            batch_size_hint: None,
        }
    }

    /// Cap pairs per batch
    pub fn with_batch_size_hint(mut self, max_pairs: usize) -> Self {
        self.batch_size_hint = Some(max_pairs);
        self
    }

    /// Check the request and turn it into the shared, read-only job inputs
    pub fn validate(self) -> Result<ValidatedJob, SubmissionError> {
        let operation: Operation = self.operation.parse()?;

        let target_layer = self.target_layer_name.trim().to_string();
        if target_layer.is_empty() {
            return Err(SubmissionError::EmptyLayerName("target"));
        }
        let mask_layer = self.mask_layer_name.trim().to_string();
        if mask_layer.is_empty() {
            return Err(SubmissionError::EmptyLayerName("mask"));
        }

        if self.batch_size_hint == Some(0) {
            return Err(SubmissionError::InvalidBatchSize);
        }

        check_features(&self.target_features, &target_layer)?;
        check_features(&self.mask_features, &mask_layer)?;

        let total_pairs =
            BatchPlanner::total_pairs(self.target_features.len(), self.mask_features.len())?;

        Ok(ValidatedJob {
            inputs: Arc::new(JobInputs {
                targets: self.target_features,
                masks: self.mask_features,
                operation,
                target_layer,
                mask_layer,
            }),
            total_pairs,
            batch_size_hint: self.batch_size_hint,
        })
    }
}

fn check_features(features: &FeatureSet, layer: &str) -> Result<(), SubmissionError> {
    let mut ids = HashSet::with_capacity(features.len());
    for (index, feature) in features.iter().enumerate() {
        if feature.id.is_empty() {
            return Err(SubmissionError::MalformedFeature {
                layer: layer.to_string(),
                index,
                reason: "empty feature id".to_string(),
            });
        }
        if let Some(reason) = feature.coordinate_problem() {
            return Err(SubmissionError::MalformedFeature {
                layer: layer.to_string(),
                index,
                reason,
            });
        }
        if !ids.insert(feature.id.as_str()) {
            return Err(SubmissionError::DuplicateFeatureId {
                layer: layer.to_string(),
                id: feature.id.clone(),
            });
        }
    }
    Ok(())
}

/// A request that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedJob {
    /// Inputs shared with every batch
    pub inputs: Arc<JobInputs>,
    /// `target_count * mask_count`
    pub total_pairs: u64,
    /// Validated cap on pairs per batch
    pub batch_size_hint: Option<usize>,
}
