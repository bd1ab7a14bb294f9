use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::JobConfigurationStore;
use crate::jobs::error::JobResult;
use crate::jobs::progress::Progress;
use crate::jobs::schedule::DueWindow;
use crate::jobs::types::{JobConfiguration, JobStatus, SchedulingType};

struct StoredJob {
    config: JobConfiguration,
    progress: Option<Progress>,
}

/// Job definitions held in process memory
///
/// Each operation runs under one write lock, which makes the conditional
/// updates atomic the same way a single SQL statement is.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, StoredJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn type_is_running(jobs: &HashMap<String, StoredJob>, job: &JobConfiguration) -> bool {
    jobs.values().any(|other| {
        other.config.uid != job.uid
            && other.config.job_type == job.job_type
            && other.config.is_running()
    })
}

/// No heartbeat since `cutoff`
fn silent_since(job: &JobConfiguration, cutoff: DateTime<Utc>) -> bool {
    job.last_alive.is_some_and(|alive| alive < cutoff)
}

/// A fixed-delay run still going twice its delay after it started
fn overdue_delay(job: &JobConfiguration, now: DateTime<Utc>) -> bool {
    job.scheduling_type == SchedulingType::FixedDelay
        && job
            .delay
            .zip(job.last_executed)
            .and_then(|(delay, executed)| {
                executed.checked_add_signed(Duration::try_seconds(delay.saturating_mul(2))?)
            })
            .is_some_and(|deadline| now > deadline)
}

/// Return a definition that stopped running to its regular schedule
fn settle(job: &mut JobConfiguration, now: DateTime<Utc>) {
    let one_off = job.is_one_off();
    if one_off {
        job.enabled = false;
    }
    job.job_status = if job.enabled {
        JobStatus::Scheduled
    } else {
        JobStatus::Disabled
    };
    job.scheduling_type = job.regular_scheduling_type();
    job.last_finished = Some(now);
    job.last_alive = None;
    job.cancel = false;
}

#[async_trait]
impl JobConfigurationStore for MemoryJobStore {
    async fn get(&self, uid: &str) -> JobResult<Option<JobConfiguration>> {
        Ok(self.jobs.read().await.get(uid).map(|j| j.config.clone()))
    }

    async fn save(&self, job: &JobConfiguration) -> JobResult<()> {
        job.validate()?;
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.uid) {
            Some(stored) => stored.config = job.clone(),
            None => {
                jobs.insert(
                    job.uid.clone(),
                    StoredJob {
                        config: job.clone(),
                        progress: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete(&self, uid: &str) -> JobResult<bool> {
        Ok(self.jobs.write().await.remove(uid).is_some())
    }

    async fn get_progress(&self, uid: &str) -> JobResult<Option<Progress>> {
        Ok(self
            .jobs
            .read()
            .await
            .get(uid)
            .and_then(|j| j.progress.clone()))
    }

    async fn get_due_job_configurations(
        &self,
        window: &DueWindow,
    ) -> JobResult<Vec<JobConfiguration>> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<JobConfiguration> = jobs
            .values()
            .map(|j| &j.config)
            .filter(|job| job.enabled && job.job_status == JobStatus::Scheduled)
            .filter(|job| {
                job.queue_position.unwrap_or(0) == 0
                    || job.scheduling_type == SchedulingType::RunOnce
            })
            .filter(|job| !type_is_running(&jobs, job))
            .filter(|job| window.due_time(job).is_some())
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.job_type, a.created).cmp(&(b.job_type, b.created)));
        Ok(due)
    }

    async fn get_next_in_queue(
        &self,
        queue: &str,
        position: i32,
    ) -> JobResult<Option<JobConfiguration>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .map(|j| &j.config)
            .find(|job| {
                job.queue_name.as_deref() == Some(queue) && job.queue_position == Some(position + 1)
            })
            .cloned())
    }

    async fn try_run(&self, uid: &str) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let startable = jobs.get(uid).is_some_and(|j| {
            j.config.job_status == JobStatus::Scheduled
                && j.config.enabled
                && !type_is_running(&jobs, &j.config)
        });
        if !startable {
            return Ok(false);
        }
        let Some(stored) = jobs.get_mut(uid) else {
            return Ok(false);
        };
        let now = Utc::now();
        stored.config.job_status = JobStatus::Running;
        stored.config.last_executed = Some(now);
        stored.config.last_alive = Some(now);
        stored.config.cancel = false;
        stored.progress = None;
        Ok(true)
    }

    async fn try_finish(&self, uid: &str, status: JobStatus) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(uid).filter(|j| j.config.is_running()) else {
            return Ok(false);
        };
        let job = &mut stored.config;
        job.last_executed_status = if job.cancel {
            JobStatus::Stopped
        } else {
            status
        };
        settle(job, Utc::now());
        Ok(true)
    }

    async fn try_revert(&self, uid: &str) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(uid).filter(|j| j.config.is_running()) else {
            return Ok(false);
        };
        let job = &mut stored.config;
        job.job_status = if job.enabled {
            JobStatus::Scheduled
        } else {
            JobStatus::Disabled
        };
        job.last_alive = None;
        job.cancel = false;
        Ok(true)
    }

    async fn try_cancel(&self, uid: &str) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(uid) else {
            return Ok(false);
        };
        let job = &mut stored.config;
        let running = job.is_running();
        let pending_manual_run = job.job_status == JobStatus::Scheduled
            && job.scheduling_type == SchedulingType::RunOnce;
        if !((running && !job.cancel) || pending_manual_run) {
            return Ok(false);
        }

        job.cancel = running;
        if job.is_one_off() {
            job.enabled = false;
        }
        job.scheduling_type = job.regular_scheduling_type();
        if !running {
            job.last_executed_status = JobStatus::Stopped;
            if !job.enabled {
                job.job_status = JobStatus::Disabled;
            }
        }
        Ok(true)
    }

    async fn try_execute_now(&self, uid: &str) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(uid) else {
            return Ok(false);
        };
        let job = &mut stored.config;
        let finished_one_off =
            job.scheduling_type == SchedulingType::RunOnce && job.last_finished.is_some();
        if !job.enabled || job.is_running() || finished_one_off {
            return Ok(false);
        }
        job.scheduling_type = SchedulingType::RunOnce;
        job.cancel = false;
        job.job_status = JobStatus::Scheduled;
        Ok(true)
    }

    async fn try_skip_queue(&self, queue: &str) -> JobResult<usize> {
        let mut jobs = self.jobs.write().await;
        let round_start = jobs
            .values()
            .map(|j| &j.config)
            .find(|job| job.queue_name.as_deref() == Some(queue) && job.queue_position == Some(0))
            .and_then(|head| head.last_executed);

        let now = Utc::now();
        let mut skipped = 0;
        for stored in jobs.values_mut() {
            let job = &mut stored.config;
            let not_started_this_round = match (job.last_executed, round_start) {
                (None, _) => true,
                (Some(executed), Some(start)) => executed < start,
                (Some(_), None) => false,
            };
            if job.queue_name.as_deref() == Some(queue)
                && job.queue_position.is_some_and(|p| p > 0)
                && job.job_status == JobStatus::Scheduled
                && not_started_this_round
            {
                job.last_executed_status = JobStatus::NotStarted;
                job.last_executed = Some(now);
                job.last_finished = Some(now);
                stored.progress = None;
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    async fn assure_running(&self, uid: &str) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(uid).filter(|j| j.config.is_running()) else {
            return Ok(false);
        };
        stored.config.last_alive = Some(Utc::now());
        Ok(true)
    }

    async fn update_progress(&self, uid: &str, progress: &Progress) -> JobResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(uid) else {
            return Ok(false);
        };
        if stored.config.is_running() {
            stored.config.last_alive = Some(Utc::now());
        }
        stored.progress = Some(progress.clone());
        Ok(true)
    }

    async fn reschedule_stale_jobs(&self, timeout_minutes: i64) -> JobResult<usize> {
        let now = Utc::now();
        let cutoff = now - Duration::minutes(timeout_minutes.max(1));
        let mut jobs = self.jobs.write().await;
        let mut rescheduled = 0;
        for stored in jobs.values_mut() {
            let job = &mut stored.config;
            if !job.is_running() || !(silent_since(job, cutoff) || overdue_delay(job, now)) {
                continue;
            }
            job.enabled =
                job.cron_expression.is_some() || job.delay.is_some() || job.queue_name.is_some();
            job.last_executed_status = JobStatus::Failed;
            settle(job, now);
            tracing::warn!(job_id = %job.uid, job_type = %job.job_type, "Rescheduled stale job");
            rescheduled += 1;
        }
        Ok(rescheduled)
    }

    async fn delete_finished_jobs(&self, ttl_minutes: i64) -> JobResult<usize> {
        let cutoff = Utc::now() - Duration::minutes(ttl_minutes.max(1));
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, stored| {
            let job = &stored.config;
            let expired_one_off = job.is_one_off()
                && job.queue_name.is_none()
                && job.last_finished.is_some_and(|finished| finished < cutoff);
            !expired_one_off
        });
        Ok(before - jobs.len())
    }

    async fn update_disabled_jobs(&self) -> JobResult<usize> {
        let mut jobs = self.jobs.write().await;
        let mut updated = 0;
        for stored in jobs.values_mut() {
            let job = &mut stored.config;
            if job.job_status == JobStatus::Scheduled && !job.enabled {
                job.job_status = JobStatus::Disabled;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
