//! Persistence of job definitions
//!
//! Every state change of a definition goes through one of the conditional
//! `try_*` operations, which apply atomically or not at all and report which.
//! The memory store serves single-process setups and tests; the PostgreSQL
//! store shares definitions between nodes.

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::jobs::error::JobResult;
use crate::jobs::progress::Progress;
use crate::jobs::schedule::DueWindow;
use crate::jobs::types::{JobConfiguration, JobStatus};

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

#[async_trait]
pub trait JobConfigurationStore: Send + Sync {
    async fn get(&self, uid: &str) -> JobResult<Option<JobConfiguration>>;

    /// Insert a new definition or replace the fields of an existing one
    async fn save(&self, job: &JobConfiguration) -> JobResult<()>;

    async fn delete(&self, uid: &str) -> JobResult<bool>;

    /// Last progress the run of this definition stored
    async fn get_progress(&self, uid: &str) -> JobResult<Option<Progress>>;

    /// Enabled, scheduled definitions due inside the window, ordered by job
    /// type then creation. Queue followers only show up when triggered
    /// manually; types with a running definition are left out.
    async fn get_due_job_configurations(&self, window: &DueWindow)
    -> JobResult<Vec<JobConfiguration>>;

    /// The member following `position` in the queue
    async fn get_next_in_queue(
        &self,
        queue: &str,
        position: i32,
    ) -> JobResult<Option<JobConfiguration>>;

    /// SCHEDULED → RUNNING, unless another definition of the type runs
    async fn try_run(&self, uid: &str) -> JobResult<bool>;

    /// RUNNING → SCHEDULED (or DISABLED), recording the outcome; a requested
    /// cancellation turns the outcome into STOPPED
    async fn try_finish(&self, uid: &str, status: JobStatus) -> JobResult<bool>;

    /// Undo a `try_run` whose run was never admitted
    async fn try_revert(&self, uid: &str) -> JobResult<bool>;

    /// Flag a running definition for cancellation or withdraw a pending
    /// manual run
    async fn try_cancel(&self, uid: &str) -> JobResult<bool>;

    /// Turn the definition into a manual run due immediately
    async fn try_execute_now(&self, uid: &str) -> JobResult<bool>;

    /// Mark members of the queue that did not start in the current round as
    /// NOT_STARTED; returns how many were skipped
    async fn try_skip_queue(&self, queue: &str) -> JobResult<usize>;

    /// Refresh `last_alive` of a running definition
    async fn assure_running(&self, uid: &str) -> JobResult<bool>;

    async fn update_progress(&self, uid: &str, progress: &Progress) -> JobResult<bool>;

    /// Fail RUNNING definitions without a heartbeat for `timeout_minutes`
    async fn reschedule_stale_jobs(&self, timeout_minutes: i64) -> JobResult<usize>;

    /// Delete one-off runs finished more than `ttl_minutes` ago
    async fn delete_finished_jobs(&self, ttl_minutes: i64) -> JobResult<usize>;

    /// SCHEDULED but disabled definitions become DISABLED
    async fn update_disabled_jobs(&self) -> JobResult<usize>;
}
