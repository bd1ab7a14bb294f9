//! Built-in job bodies

mod housekeeping;
mod test_job;

pub use housekeeping::{HousekeepingJob, HousekeepingParameters};
pub use test_job::{TestJob, TestJobParameters};
