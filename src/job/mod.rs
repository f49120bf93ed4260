//! Overlay jobs: requests, lifecycle and events

pub mod controller;
pub mod events;
pub mod request;
pub mod state;

pub use controller::{EventSender, JobController, JobHandle, JobOutcome};
pub use events::{CancelRequest, CompletionEvent, JobEvent, JobId, JobStatistics, ProgressEvent};
pub use request::{JobRequest, SubmissionError, ValidatedJob};
pub use state::{JobState, StateMachine, TransitionError};
