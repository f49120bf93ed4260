//! Batch planning, execution and aggregation

pub mod aggregation;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod types;
pub mod worker;

pub use aggregation::*;
pub use planner::*;
pub use progress::*;
pub use retry::*;
pub use types::*;
pub use worker::*;
