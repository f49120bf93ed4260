//! Job lifecycle state machine

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of an overlay job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet planned
    Pending,
    /// Batch list being computed
    Planning,
    /// Batches being handed to the worker pool
    Dispatching,
    /// Waiting for batch results
    Running,
    /// Every pair accounted for; ordering and labelling results
    Aggregating,
    /// Final result set available
    Completed,
    /// Cancelled by request; partial results discarded
    Cancelled,
    /// Rejected or hit a job-level infrastructure error
    Failed,
}

impl JobState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Planning => 1,
            Self::Dispatching => 2,
            Self::Running => 3,
            Self::Aggregating => 4,
            Self::Completed | Self::Cancelled | Self::Failed => 5,
        }
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// The happy path only moves forward; `Planning -> Completed` covers jobs
    /// with no pairs. `Cancelled` and `Failed` are reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled | Self::Failed => true,
            Self::Completed => matches!(self, Self::Planning | Self::Aggregating),
            _ => next.rank() == self.rank() + 1,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Dispatching => "dispatching",
            Self::Running => "running",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal job state transition {from} -> {to}")]
pub struct TransitionError {
    /// State the job was in
    pub from: JobState,
    /// State that was requested
    pub to: JobState,
}

/// Guards a job's state and keeps the path it took
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: JobState,
    history: Vec<JobState>,
}

impl StateMachine {
    /// Machine in `Pending`
    pub fn new() -> Self {
        Self {
            current: JobState::Pending,
            history: vec![JobState::Pending],
        }
    }

    /// Current state
    pub fn current(&self) -> JobState {
        self.current
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: JobState) -> Result<JobState, TransitionError> {
        if !self.current.can_transition_to(next) {
            return Err(TransitionError {
                from: self.current,
                to: next,
            });
        }
        let previous = std::mem::replace(&mut self.current, next);
        self.history.push(next);
        Ok(previous)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
