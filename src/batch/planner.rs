//! Batch planning
//!
//! Partitions `[0, target_count) × [0, mask_count)` into contiguous rectangles of at
//! most `max_pairs` pairs. Target rows are kept together whenever a batch can hold
//! whole rows, so a worker reads each target feature once per batch.

use tracing::debug;

use crate::batch::types::{BatchId, BatchSpan};

/// How large batches should be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSizing {
    /// Upper bound on pairs per batch
    MaxPairs(usize),
    /// Derive the bound from the pool: about `batches_per_worker` batches per worker
    Workers {
        /// Pool size
        workers: usize,
        /// Target batch count per worker
        batches_per_worker: usize,
    },
}

/// Planning error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    /// A batch bound of zero pairs
    #[error("batch size must be at least one pair")]
    ZeroBatchSize,

    /// `target_count * mask_count` does not fit in `u64`
    #[error("pair space {target_count} x {mask_count} overflows")]
    PairSpaceOverflow {
        /// Target count
        target_count: usize,
        /// Mask count
        mask_count: usize,
    },
}

/// Stateless planner over the pair space
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchPlanner;

impl BatchPlanner {
    /// Total number of pairs, or an overflow error
    pub fn total_pairs(target_count: usize, mask_count: usize) -> Result<u64, PlanningError> {
        (target_count as u64)
            .checked_mul(mask_count as u64)
            .filter(|total| *total <= usize::MAX as u64)
            .ok_or(PlanningError::PairSpaceOverflow {
                target_count,
                mask_count,
            })
    }

    /// Resolve a sizing hint into a concrete pairs-per-batch bound
    pub fn max_pairs(total_pairs: u64, sizing: BatchSizing) -> Result<usize, PlanningError> {
        match sizing {
            BatchSizing::MaxPairs(0) => Err(PlanningError::ZeroBatchSize),
            BatchSizing::MaxPairs(max) => Ok(max),
            BatchSizing::Workers {
                workers,
                batches_per_worker,
            } => {
                let slots = (workers.max(1) as u64) * (batches_per_worker.max(1) as u64);
                Ok(total_pairs.div_ceil(slots).max(1) as usize)
            }
        }
    }

    /// Plan the batch list; empty when either side is empty
    pub fn plan(
        &self,
        target_count: usize,
        mask_count: usize,
        sizing: BatchSizing,
    ) -> Result<Vec<BatchSpan>, PlanningError> {
        let total = Self::total_pairs(target_count, mask_count)?;
        let max_pairs = Self::max_pairs(total, sizing)?;

        if total == 0 {
            return Ok(Vec::new());
        }

        let mut spans = Vec::new();
        let mut push = |targets: std::ops::Range<usize>, masks: std::ops::Range<usize>| {
            let id = BatchId(spans.len());
            spans.push(BatchSpan { id, targets, masks });
        };

        if max_pairs >= mask_count {
            // Whole rows fit: group several target rows per batch.
            let rows_per_batch = max_pairs / mask_count;
            let mut start = 0;
            while start < target_count {
                let end = (start + rows_per_batch).min(target_count);
                push(start..end, 0..mask_count);
                start = end;
            }
        } else {
            // Rows are wider than a batch: slice each row along the mask axis.
            for target in 0..target_count {
                let mut start = 0;
                while start < mask_count {
                    let end = (start + max_pairs).min(mask_count);
                    push(target..target + 1, start..end);
                    start = end;
                }
            }
        }

        debug!(
            target_count,
            mask_count,
            max_pairs,
            batches = spans.len(),
            "Planned overlay batches"
        );

        Ok(spans)
    }
}
