//! Events a job reports to its caller

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::OverlayResultItem;
use crate::job::JobState;

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Progress report; `percent` never decreases within a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Job reporting
    pub job_id: JobId,
    /// Pairs accounted for so far
    pub processed_pairs: u64,
    /// Size of the pair space
    pub total_pairs: u64,
    /// `processed_pairs / total_pairs` in percent
    pub percent: f64,
    /// Batches merged, failed ones included
    pub completed_batches: usize,
    /// Batches planned
    pub total_batches: usize,
}

/// Final outcome of a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    /// Job that completed
    pub job_id: JobId,
    /// Ordered by `(target_index, mask_index)`
    pub results: Vec<OverlayResultItem>,
    /// Evaluated pairs that yielded no result
    pub skipped_pairs: u64,
    /// Batches that failed on every attempt
    pub failed_batch_count: usize,
    /// Size of the pair space
    pub total_pairs: u64,
    /// Pairs rejected as invalid; included in `skipped_pairs`
    pub invalid_pairs: u64,
    /// Summary figures for the whole job
    pub statistics: JobStatistics,
}

/// Per-job summary reported with the results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    /// Result items produced
    pub total_results: usize,
    /// Features in the target layer
    pub target_feature_count: usize,
    /// Features in the mask layer
    pub mask_feature_count: usize,
    /// `target_feature_count * mask_feature_count`
    pub total_pairs: u64,
    /// Wall-clock time from planning to aggregation
    pub processing_time_ms: u64,
    /// Time workers spent evaluating batches, summed over batches
    pub batch_time_ms: u64,
    /// Share of pairs that produced a result, in percent with two decimals
    pub success_rate: f64,
}

impl JobStatistics {
    /// Statistics for a job over `target_count * mask_count` pairs
    pub fn new(
        target_count: usize,
        mask_count: usize,
        total_results: usize,
        processing_time: Duration,
        batch_time: Duration,
    ) -> Self {
        let total_pairs = target_count as u64 * mask_count as u64;
        let success_rate = if total_pairs > 0 {
            let percent = total_results as f64 / total_pairs as f64 * 100.0;
            (percent * 100.0).round() / 100.0
        } else {
            0.0
        };
        Self {
            total_results,
            target_feature_count: target_count,
            mask_feature_count: mask_count,
            total_pairs,
            processing_time_ms: processing_time.as_millis() as u64,
            batch_time_ms: batch_time.as_millis() as u64,
            success_rate,
        }
    }
}

/// Everything a job reports to its caller, in emission order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// The job moved between lifecycle states
    StateChanged {
        /// Job that moved
        job_id: JobId,
        /// Previous state
        from: JobState,
        /// New state
        to: JobState,
    },
    /// More pairs were accounted for
    Progress(ProgressEvent),
    /// Terminal: results available
    Completed(CompletionEvent),
    /// Terminal: cancelled by request
    Cancelled {
        /// Job that was cancelled
        job_id: JobId,
    },
    /// Terminal: rejected or infrastructure failure
    Failed {
        /// Job that failed
        job_id: JobId,
        /// Human-readable cause
        reason: String,
    },
}

impl JobEvent {
    /// Job the event belongs to
    pub fn job_id(&self) -> JobId {
        match self {
            Self::StateChanged { job_id, .. }
            | Self::Cancelled { job_id }
            | Self::Failed { job_id, .. } => *job_id,
            Self::Progress(progress) => progress.job_id,
            Self::Completed(done) => done.job_id,
        }
    }

    /// Whether this is the job's last event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Cancelled { .. } | Self::Failed { .. })
    }
}

/// Cancellation request addressed to a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    /// Job to cancel
    pub job_id: JobId,
}
