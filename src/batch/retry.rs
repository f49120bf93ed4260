//! Retry policy for failed batches

use crate::batch::types::BatchInfrastructureError;

/// Decision made after a batch failure
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Resubmit, preferably to a worker other than `avoid_worker`
    Retry {
        /// Number of the next attempt
        attempt: u32,
        /// Worker the failed attempt ran on
        avoid_worker: Option<usize>,
    },
    /// Give up; the batch's pairs are accounted as processed with zero results
    PermanentFailure,
}

/// Bounded retry of failed batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Policy allowing `max_attempts` runs of a batch in total
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Total runs allowed per batch
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after `attempt` (1-based) failed on `worker`
    pub fn decide(
        &self,
        attempt: u32,
        worker: Option<usize>,
        error: &BatchInfrastructureError,
    ) -> RetryDecision {
        if matches!(error, BatchInfrastructureError::NoWorkers) || attempt >= self.max_attempts {
            return RetryDecision::PermanentFailure;
        }
        RetryDecision::Retry {
            attempt: attempt + 1,
            avoid_worker: worker,
        }
    }
}

impl Default for RetryPolicy {
    /// One retry
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn crash() -> BatchInfrastructureError {
        BatchInfrastructureError::WorkerCrashed {
            worker: 1,
            message: "boom".into(),
        }
    }

    #[test]
    fn test_default_retries_once() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, Some(1), &crash()),
            RetryDecision::Retry {
                attempt: 2,
                avoid_worker: Some(1)
            }
        );
        assert_eq!(policy.decide(2, Some(0), &crash()), RetryDecision::PermanentFailure);
    }

    #[test]
    fn test_timeouts_are_retried_like_crashes() {
        let timeout = BatchInfrastructureError::TimedOut {
            elapsed: Duration::from_secs(3),
        };
        assert!(matches!(
            RetryPolicy::default().decide(1, Some(0), &timeout),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_no_workers_is_permanent() {
        assert_eq!(
            RetryPolicy::new(5).decide(1, None, &BatchInfrastructureError::NoWorkers),
            RetryDecision::PermanentFailure
        );
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::new(1).decide(1, None, &crash()), RetryDecision::PermanentFailure);
    }
}
