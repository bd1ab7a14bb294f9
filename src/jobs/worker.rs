//! Executes due definitions on the node's task tracker.
//!
//! Ordinary job types get one task per dispatched run. Job types flagged for
//! continuous execution share a lane per type: dispatching only enqueues the
//! definition, and a single drain task per lane works the backlog off in
//! order, so a busy type never occupies more than one task.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::task::TaskTracker;

use crate::config::settings::SchedulerConfig;
use crate::jobs::coordinator::RunCoordinator;
use crate::jobs::error::JobResult;
use crate::jobs::progress::{Failure, JobProgress, RecordingJobProgress, Retention, Status};
use crate::jobs::queue::JobQueue;
use crate::jobs::registry::JobRegistry;
use crate::jobs::store::JobConfigurationStore;
use crate::jobs::types::{JobConfiguration, JobStatus, JobType};
use crate::notifications::NotificationSender;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub retention: Retention,
    pub bucket_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retention: Retention::Full,
            bucket_size: 1,
        }
    }
}

impl From<&SchedulerConfig> for WorkerConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            retention: config.retention,
            bucket_size: config.bucket_size as usize,
        }
    }
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<String>,
    draining: bool,
}

struct WorkerInner {
    store: Arc<dyn JobConfigurationStore>,
    registry: JobRegistry,
    coordinator: Arc<RunCoordinator>,
    queue: JobQueue,
    notifications: NotificationSender,
    config: WorkerConfig,
    tracker: TaskTracker,
    lanes: Mutex<HashMap<JobType, Lane>>,
    stopping: AtomicBool,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerInner>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobConfigurationStore>,
        registry: JobRegistry,
        coordinator: Arc<RunCoordinator>,
        notifications: NotificationSender,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                queue: JobQueue::new(store.clone()),
                store,
                registry,
                coordinator,
                notifications,
                config,
                tracker: TaskTracker::new(),
                lanes: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Tracker of every worker task, used to drain the pool on shutdown
    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Run `job` at `due`, on its continuous lane when it has one
    pub fn dispatch(&self, job: JobConfiguration, due: DateTime<Utc>) {
        self.inner.dispatch(job, due);
    }

    /// Refuse new runs; runs already started go on until they observe
    /// cancellation
    pub fn stop_accepting(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
    }

    /// Number of definitions waiting on the lane of `job_type`
    pub fn pending(&self, job_type: JobType) -> usize {
        self.inner
            .lock_lanes()
            .get(&job_type)
            .map_or(0, |lane| lane.pending.len())
    }

    /// Run `job` to completion on the calling task
    ///
    /// Returns the outcome, or `None` when the run did not start.
    pub async fn run(&self, job: JobConfiguration, due: DateTime<Utc>) -> Option<JobStatus> {
        self.inner.run_job(job, due).await
    }
}

impl WorkerInner {
    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, HashMap<JobType, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(self: &Arc<Self>, job: JobConfiguration, due: DateTime<Utc>) {
        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(job_id = %job.uid, "Worker pool is shutting down, run not dispatched");
            return;
        }
        if job.continuous_execution {
            self.enqueue_continuous(job);
        } else {
            let inner = self.clone();
            self.tracker.spawn(async move {
                inner.run_job(job, due).await;
            });
        }
    }

    fn enqueue_continuous(self: &Arc<Self>, job: JobConfiguration) {
        let job_type = job.job_type;
        let start_drain = {
            let mut lanes = self.lock_lanes();
            let lane = lanes.entry(job_type).or_default();
            if !lane.pending.contains(&job.uid) {
                lane.pending.push_back(job.uid);
            }
            !std::mem::replace(&mut lane.draining, true)
        };
        if start_drain {
            let inner = self.clone();
            self.tracker.spawn(async move {
                inner.drain(job_type).await;
            });
        }
    }

    async fn drain(self: Arc<Self>, job_type: JobType) {
        loop {
            let next = {
                let mut lanes = self.lock_lanes();
                let lane = lanes.entry(job_type).or_default();
                let next = lane.pending.pop_front();
                if next.is_none() {
                    lane.draining = false;
                }
                next
            };
            let Some(uid) = next else {
                break;
            };
            if self.stopping.load(Ordering::SeqCst) {
                self.lock_lanes().remove(&job_type);
                break;
            }
            match self.store.get(&uid).await {
                Ok(Some(job)) => {
                    self.run_job(job, Utc::now()).await;
                }
                Ok(None) => tracing::debug!(job_id = %uid, "Queued definition no longer exists"),
                Err(e) => tracing::warn!(job_id = %uid, error = %e, "Could not load queued definition"),
            }
        }
    }

    async fn run_job(self: &Arc<Self>, job: JobConfiguration, due: DateTime<Utc>) -> Option<JobStatus> {
        if !self.registry.contains(job.job_type) {
            tracing::error!(job_id = %job.uid, job_type = %job.job_type, "No job body registered, run skipped");
            return None;
        }
        if let Ok(wait) = (due - Utc::now()).to_std() {
            tokio::time::sleep(wait).await;
        }

        match self.store.try_run(&job.uid).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job.uid, "Definition not startable, run skipped");
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = %job.uid, error = %e, "Could not mark definition running");
                return None;
            }
        }
        let job = match self.store.get(&job.uid).await {
            Ok(Some(current)) => current,
            _ => job,
        };

        let progress = Arc::new(
            RecordingJobProgress::new(&job)
                .with_retention(self.config.retention)
                .with_bucket_size(self.config.bucket_size)
                .with_notifications(self.notifications.clone()),
        );
        let admission = self
            .coordinator
            .try_start(job.job_type, &job.uid, progress.clone())
            .await;
        if !admission.is_admitted() {
            tracing::debug!(job_id = %job.uid, admission = ?admission, "Run not admitted");
            if let Err(e) = self.store.try_revert(&job.uid).await {
                tracing::warn!(job_id = %job.uid, error = %e, "Could not revert definition");
            }
            return None;
        }

        let status = self.execute(&job, progress.clone()).await;

        self.coordinator.finish(job.job_type, &job.uid).await;
        if let Err(e) = self.store.update_progress(&job.uid, &progress.snapshot()).await {
            tracing::warn!(job_id = %job.uid, error = %e, "Could not store final progress");
        }
        match self.store.try_finish(&job.uid, status).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(job_id = %job.uid, "Definition was no longer running at finish"),
            Err(e) => tracing::error!(job_id = %job.uid, error = %e, "Could not record run outcome"),
        }

        match self.queue.follow_up(&job, status).await {
            Ok(Some(next)) => self.dispatch(next, due),
            Ok(None) => {}
            Err(e) => tracing::error!(job_id = %job.uid, error = %e, "Could not continue job queue"),
        }
        Some(status)
    }

    async fn execute(&self, job: &JobConfiguration, progress: Arc<RecordingJobProgress>) -> JobStatus {
        let body = match self.registry.get(job.job_type) {
            Ok(body) => body,
            Err(e) => {
                progress.fail_run(Failure::from(&e));
                return JobStatus::Failed;
            }
        };

        tracing::info!(job_id = %job.uid, job_name = %job.name, job_type = %job.job_type, "Job started");
        let started = tokio::time::Instant::now();
        let reporter: Arc<dyn JobProgress> = progress.clone();
        let result = AssertUnwindSafe(body.execute(job, reporter))
            .catch_unwind()
            .await;
        let status = outcome(result, &progress);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match status {
            JobStatus::Completed => {
                tracing::info!(job_id = %job.uid, job_type = %job.job_type, elapsed_ms, "Job completed")
            }
            JobStatus::Stopped => {
                tracing::info!(job_id = %job.uid, job_type = %job.job_type, elapsed_ms, "Job stopped")
            }
            _ => tracing::warn!(
                job_id = %job.uid,
                job_type = %job.job_type,
                elapsed_ms,
                error = %progress.snapshot().error_message().unwrap_or_default(),
                "Job failed"
            ),
        }
        status
    }
}

/// Map what the body returned, and what it reported, to the run outcome
fn outcome(
    result: Result<JobResult<()>, Box<dyn Any + Send>>,
    progress: &RecordingJobProgress,
) -> JobStatus {
    match result {
        Ok(Ok(())) if progress.is_aborted() => JobStatus::Failed,
        Ok(Ok(())) if progress.is_cancelled() => {
            progress.close_open_nodes(Status::Cancelled);
            JobStatus::Stopped
        }
        Ok(Ok(())) => {
            progress.close_open_nodes(Status::Success);
            let failed = progress
                .snapshot()
                .processes
                .iter()
                .any(|process| process.node.status == Status::Error);
            if failed {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            }
        }
        Ok(Err(e)) if e.is_cancellation() => {
            if progress.is_aborted() {
                JobStatus::Failed
            } else {
                progress.close_open_nodes(Status::Cancelled);
                JobStatus::Stopped
            }
        }
        Ok(Err(e)) => {
            progress.fail_run(Failure::from(&e));
            JobStatus::Failed
        }
        Err(panic) => {
            progress.fail_run(Failure::new(format!("job panicked: {}", panic_message(&*panic))));
            JobStatus::Failed
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
