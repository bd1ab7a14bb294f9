use std::future::Future;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::progress::types::{FailurePolicy, Failure, ItemHandle, Progress};

/// Progress reporting contract handed to every job body
///
/// All methods are synchronous and may be called from the job's own task or
/// from tasks it spawned. The `starting_*` methods are where cancellation is
/// observed: once it has been requested they return [`JobError::Cancelled`].
/// `completed_*` and `failed_*` close the most recently opened node of their
/// level and are no-ops when there is none.
pub trait JobProgress: Send + Sync {
    fn is_cancelled(&self) -> bool;

    /// True when a `Fail` policy escalated a failure into an abort
    fn is_aborted(&self) -> bool;

    /// True when the current stage should not process further items
    fn is_skip_current_stage(&self) -> bool;

    /// Returns `false` if cancellation was already requested
    fn request_cancellation(&self) -> bool;

    fn starting_process(&self, description: &str) -> JobResult<()>;

    fn completed_process(&self, summary: Option<&str>);

    fn failed_process(&self, failure: Failure);

    /// `work_items` is the announced number of items, 0 when unknown
    fn starting_stage(
        &self,
        description: &str,
        work_items: usize,
        on_failure: FailurePolicy,
    ) -> JobResult<()>;

    fn completed_stage(&self, summary: Option<&str>);

    fn failed_stage(&self, failure: Failure);

    fn starting_work_item(
        &self,
        description: &str,
        on_failure: FailurePolicy,
    ) -> JobResult<ItemHandle>;

    fn completed_work_item(&self, summary: Option<&str>);

    fn completed_work_item_at(&self, item: ItemHandle, summary: Option<&str>);

    fn failed_work_item(&self, failure: Failure);

    fn failed_work_item_at(&self, item: ItemHandle, failure: Failure);

    fn snapshot(&self) -> Progress;
}

impl dyn JobProgress + '_ {
    /// Unwrap a value a stage must produce; a missing value fails the stage
    /// and stops the run
    pub fn non_null_stage_post_condition<T>(&self, value: Option<T>) -> JobResult<T> {
        match value {
            Some(value) => Ok(value),
            None => {
                self.failed_stage(Failure::new("stage post condition was not met"));
                Err(JobError::Cancelled)
            }
        }
    }

    /// Run `work` for every item as a work item of the open stage
    ///
    /// Stops early when the stage is skipped or the run is cancelled. Closes
    /// the stage if it is still open and returns whether the run can go on.
    pub async fn run_stage<T, D, W, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        describe: D,
        mut work: W,
    ) -> bool
    where
        D: Fn(&T) -> String,
        W: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), Failure>>,
    {
        for item in items {
            if self.is_skip_current_stage() {
                break;
            }
            let description = describe(&item);
            if self
                .starting_work_item(&description, FailurePolicy::Parent)
                .is_err()
            {
                return false;
            }
            match work(item).await {
                Ok(()) => self.completed_work_item(None),
                Err(failure) => self.failed_work_item(failure),
            }
        }

        if self.is_cancelled() {
            return false;
        }
        self.completed_stage(None);
        true
    }
}
