//! Hierarchical progress of a job run
//!
//! A run reports Process → Stage → Item transitions through [`JobProgress`];
//! [`RecordingJobProgress`] keeps the resulting [`Progress`] tree in memory,
//! applies the failure policies and carries the cancellation flag.

mod reporter;
mod tracker;
mod types;

pub use reporter::JobProgress;
pub use tracker::RecordingJobProgress;
pub use types::{
    Failure, FailurePolicy, Item, ItemHandle, Node, Process, Progress, Retention, Stage, Status,
};
