//! Merging batch results into the job's final result set

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::batch::types::{BatchId, BatchInfrastructureError, BatchResult, OverlayResultItem};
use crate::overlay::Operation;

/// Batch whose pairs were accounted for without results
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    /// Batch that failed
    pub batch_id: BatchId,
    /// Pairs it covered
    pub pairs: u64,
    /// Error from the last attempt
    pub error: BatchInfrastructureError,
}

/// What happened to a merged batch result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First result for the batch, counted
    Merged,
    /// The batch had already been merged; the reply was dropped
    Duplicate,
}

/// Final, ordered result set of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResults {
    /// Items ordered by provenance, with display labels
    pub results: Vec<OverlayResultItem>,
    /// Size of the pair space
    pub total_pairs: u64,
    /// Pairs accounted for, including those of failed batches
    pub processed_pairs: u64,
    /// Evaluated pairs without a result
    pub skipped_pairs: u64,
    /// Pairs the computer rejected as invalid
    pub invalid_pairs: u64,
    /// Batches that exhausted their attempts
    pub failed_batch_count: usize,
    /// Worker time spent on merged batches
    pub batch_time: Duration,
}

/// Merges batch results in arrival order.
///
/// Each pair yields at most one item and each batch is merged at most once, so
/// merging is a concatenation; provenance makes the final order independent of
/// arrival order.
#[derive(Debug)]
pub struct ResultAggregator {
    total_pairs: u64,
    processed_pairs: u64,
    skipped_pairs: u64,
    invalid_pairs: u64,
    results: Vec<OverlayResultItem>,
    failed_batches: Vec<FailedBatch>,
    merged: HashSet<BatchId>,
    batch_time: Duration,
}

impl ResultAggregator {
    /// Aggregator expecting `total_pairs` pairs
    pub fn new(total_pairs: u64) -> Self {
        Self {
            total_pairs,
            processed_pairs: 0,
            skipped_pairs: 0,
            invalid_pairs: 0,
            results: Vec::new(),
            failed_batches: Vec::new(),
            merged: HashSet::new(),
            batch_time: Duration::ZERO,
        }
    }

    /// Merge one batch result (successful or permanently failed)
    pub fn merge(&mut self, result: BatchResult) -> MergeOutcome {
        if !self.merged.insert(result.batch_id) {
            warn!(batch_id = %result.batch_id, "Dropping duplicate batch result");
            return MergeOutcome::Duplicate;
        }

        self.processed_pairs += result.processed_pairs;
        self.batch_time += result.duration;

        if let Some(error) = result.error {
            self.failed_batches.push(FailedBatch {
                batch_id: result.batch_id,
                pairs: result.processed_pairs,
                error,
            });
        } else {
            self.skipped_pairs += result.skipped_pairs;
            self.invalid_pairs += result.invalid_pairs;
            self.results.extend(result.items);
        }

        debug!(
            batch_id = %result.batch_id,
            processed = self.processed_pairs,
            total = self.total_pairs,
            "Merged batch result"
        );

        MergeOutcome::Merged
    }

    /// Every pair has been accounted for
    pub fn is_complete(&self) -> bool {
        self.processed_pairs == self.total_pairs
    }

    /// Pairs merged so far
    pub fn processed_pairs(&self) -> u64 {
        self.processed_pairs
    }

    /// Pairs expected
    pub fn total_pairs(&self) -> u64 {
        self.total_pairs
    }

    /// Distinct batches merged, failed ones included
    pub fn merged_batches(&self) -> usize {
        self.merged.len()
    }

    /// Batches merged as permanent failures
    pub fn failed_batches(&self) -> &[FailedBatch] {
        &self.failed_batches
    }

    /// Order results by provenance and label them `"<Operation label> area <n>"`
    pub fn finalize(self, operation: Operation) -> AggregatedResults {
        let mut results = self.results;
        results.sort_by_key(|item| item.provenance.pair());
        for (n, item) in results.iter_mut().enumerate() {
            item.name = Some(format!("{} area {}", operation.label(), n + 1));
        }

        AggregatedResults {
            results,
            total_pairs: self.total_pairs,
            processed_pairs: self.processed_pairs,
            skipped_pairs: self.skipped_pairs,
            invalid_pairs: self.invalid_pairs,
            failed_batch_count: self.failed_batches.len(),
            batch_time: self.batch_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::{BatchSpan, Provenance};
    use geo::{point, Geometry};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn item(target: usize, mask: usize) -> OverlayResultItem {
        OverlayResultItem::new(
            Operation::Intersection,
            Geometry::Point(point!(x: target as f64, y: mask as f64)),
            Provenance {
                target_index: target,
                mask_index: mask,
                target_feature_id: format!("t{target}"),
                mask_feature_id: format!("m{mask}"),
                target_layer: "a".into(),
                mask_layer: "b".into(),
            },
        )
    }

    fn batch(id: usize, items: Vec<OverlayResultItem>, processed: u64) -> BatchResult {
        let skipped = processed - items.len() as u64;
        BatchResult {
            batch_id: BatchId(id),
            items,
            processed_pairs: processed,
            skipped_pairs: skipped,
            invalid_pairs: 0,
            error: None,
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_out_of_order_merge_is_sorted_and_labelled() {
        let mut aggregator = ResultAggregator::new(4);
        assert_eq!(aggregator.merge(batch(1, vec![item(1, 1)], 2)), MergeOutcome::Merged);
        assert!(!aggregator.is_complete());
        assert_eq!(aggregator.merge(batch(0, vec![item(0, 1), item(0, 0)], 2)), MergeOutcome::Merged);
        assert!(aggregator.is_complete());

        let done = aggregator.finalize(Operation::Intersection);
        let order: Vec<_> = done.results.iter().map(|i| i.provenance.pair()).collect();
        assert_eq!(
            order,
            vec![
                crate::batch::PairIndex::new(0, 0),
                crate::batch::PairIndex::new(0, 1),
                crate::batch::PairIndex::new(1, 1),
            ]
        );
        assert_eq!(done.results[2].name.as_deref(), Some("Intersection area 3"));
        assert_eq!(done.skipped_pairs, 1);
        assert_eq!(done.batch_time, Duration::from_millis(2));
    }

    #[test]
    fn test_duplicate_batches_are_ignored() {
        let mut aggregator = ResultAggregator::new(2);
        aggregator.merge(batch(0, vec![item(0, 0)], 2));
        assert_eq!(aggregator.merge(batch(0, vec![item(0, 0)], 2)), MergeOutcome::Duplicate);
        assert_eq!(aggregator.processed_pairs(), 2);
        assert_eq!(aggregator.finalize(Operation::Intersection).results.len(), 1);
    }

    #[test]
    fn test_failed_batch_counts_pairs_without_results() {
        let span = BatchSpan {
            id: BatchId(0),
            targets: 0..2,
            masks: 0..3,
        };
        let mut aggregator = ResultAggregator::new(6);
        aggregator.merge(BatchResult::permanently_failed(
            &span,
            BatchInfrastructureError::NoWorkers,
        ));

        assert!(aggregator.is_complete());
        assert_eq!(aggregator.failed_batches().len(), 1);
        let done = aggregator.finalize(Operation::Difference);
        assert_eq!(done.failed_batch_count, 1);
        assert_eq!(done.skipped_pairs, 0);
        assert!(done.results.is_empty());
    }
}
