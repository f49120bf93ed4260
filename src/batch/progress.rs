//! Monotonic job progress

/// Progress derived from processed/total pair counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Pairs accounted for
    pub processed_pairs: u64,
    /// Size of the pair space
    pub total_pairs: u64,
    /// `processed_pairs / total_pairs` in percent
    pub percent: f64,
}

/// Tracks progress for one job and only reports forward movement
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_pairs: u64,
    last_reported: Option<u64>,
}

impl ProgressTracker {
    /// Tracker for a job of `total_pairs` pairs
    pub fn new(total_pairs: u64) -> Self {
        Self {
            total_pairs,
            last_reported: None,
        }
    }

    /// `processed / total * 100`, clamped to `[0, 100]`; 100 for an empty job
    pub fn percent(processed_pairs: u64, total_pairs: u64) -> f64 {
        if total_pairs == 0 {
            return 100.0;
        }
        (processed_pairs as f64 / total_pairs as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Snapshot to report for a new processed count, or `None` if it would not move forward
    pub fn observe(&mut self, processed_pairs: u64) -> Option<ProgressSnapshot> {
        let processed_pairs = processed_pairs.min(self.total_pairs);
        if self.last_reported.is_some_and(|last| processed_pairs <= last) {
            return None;
        }
        self.last_reported = Some(processed_pairs);
        Some(ProgressSnapshot {
            processed_pairs,
            total_pairs: self.total_pairs,
            percent: Self::percent(processed_pairs, self.total_pairs),
        })
    }

    /// Current percentage without reporting anything
    pub fn current_percent(&self) -> f64 {
        Self::percent(self.last_reported.unwrap_or(0), self.total_pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_job_is_complete() {
        let mut tracker = ProgressTracker::new(0);
        let snapshot = tracker.observe(0).expect("first observation reports");
        assert_eq!(snapshot.percent, 100.0);
        assert!(tracker.observe(0).is_none());
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let mut tracker = ProgressTracker::new(8);
        assert_eq!(tracker.observe(4).map(|s| s.percent), Some(50.0));
        assert!(tracker.observe(4).is_none());
        assert!(tracker.observe(2).is_none());
        assert_eq!(tracker.observe(8).map(|s| s.percent), Some(100.0));
        assert_eq!(tracker.current_percent(), 100.0);
    }

    #[test]
    fn test_percent_is_clamped() {
        assert_eq!(ProgressTracker::percent(12, 10), 100.0);
        let mut tracker = ProgressTracker::new(10);
        assert_eq!(tracker.observe(15).map(|s| s.processed_pairs), Some(10));
    }
}
