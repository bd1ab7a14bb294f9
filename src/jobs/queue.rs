//! Job queues: named chains of definitions that run one after another.
//!
//! The head (position 0) carries the schedule. Followers never become due on
//! their own; a successful run hands over to the next position, and a failed
//! or stopped one ends the round and marks the remaining followers as not
//! started.

use std::sync::Arc;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::store::JobConfigurationStore;
use crate::jobs::types::{JobConfiguration, JobStatus};

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobConfigurationStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobConfigurationStore>) -> Self {
        Self { store }
    }

    /// Store `members` as the queue `name`, in the given order
    ///
    /// The first member must have a cron expression or a delay; it keeps its
    /// schedule, the others become queue members.
    pub async fn create(
        &self,
        name: &str,
        members: Vec<JobConfiguration>,
    ) -> JobResult<Vec<JobConfiguration>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(JobError::InvalidParameters("queue name must not be empty".into()));
        }
        if members.len() < 2 {
            return Err(JobError::InvalidParameters(format!(
                "queue '{name}' needs at least two members"
            )));
        }
        if members[0].cron_expression.is_none() && members[0].delay.is_none() {
            return Err(JobError::InvalidParameters(format!(
                "head of queue '{name}' needs a cron expression or a delay"
            )));
        }
        if self.head(name).await?.is_some() {
            return Err(JobError::InvalidParameters(format!(
                "queue '{name}' already exists"
            )));
        }

        let mut stored = Vec::with_capacity(members.len());
        for (position, member) in members.into_iter().enumerate() {
            let member = member.in_queue(name, position as i32);
            self.store.save(&member).await?;
            stored.push(member);
        }
        tracing::info!(queue = name, members = stored.len(), "Job queue created");
        Ok(stored)
    }

    pub async fn head(&self, name: &str) -> JobResult<Option<JobConfiguration>> {
        self.store.get_next_in_queue(name, -1).await
    }

    /// Members in queue order
    pub async fn members(&self, name: &str) -> JobResult<Vec<JobConfiguration>> {
        let mut members = Vec::new();
        let mut position = -1;
        while let Some(member) = self.store.get_next_in_queue(name, position).await? {
            position = member.queue_position.unwrap_or(position + 1);
            members.push(member);
        }
        Ok(members)
    }

    /// Member that runs after `job`, if `job` is in a queue
    pub async fn next_after(&self, job: &JobConfiguration) -> JobResult<Option<JobConfiguration>> {
        match (job.queue_name.as_deref(), job.queue_position) {
            (Some(queue), Some(position)) => self.store.get_next_in_queue(queue, position).await,
            _ => Ok(None),
        }
    }

    /// Continue the round after `job` finished with `status`
    ///
    /// Returns the member to run next. A round that ends early leaves the
    /// remaining members NOT_STARTED.
    pub async fn follow_up(
        &self,
        job: &JobConfiguration,
        status: JobStatus,
    ) -> JobResult<Option<JobConfiguration>> {
        let Some(queue) = job.queue_name.as_deref() else {
            return Ok(None);
        };

        if status == JobStatus::Completed {
            let next = self.next_after(job).await?;
            if let Some(next) = &next {
                tracing::debug!(queue, next = %next.uid, "Handing over to next queue member");
            }
            return Ok(next);
        }

        let skipped = self.store.try_skip_queue(queue).await?;
        if skipped > 0 {
            tracing::info!(queue, skipped, status = %status, "Queue round ended early");
        }
        Ok(None)
    }

    /// Remove every member of the queue; returns how many were deleted
    pub async fn delete(&self, name: &str) -> JobResult<usize> {
        let members = self.members(name).await?;
        let mut deleted = 0;
        for member in members {
            if self.store.delete(&member.uid).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryJobStore;
    use crate::jobs::types::{JobType, SchedulingType};

    fn queue() -> (JobQueue, Arc<dyn JobConfigurationStore>) {
        let store: Arc<dyn JobConfigurationStore> = Arc::new(MemoryJobStore::new());
        (JobQueue::new(store.clone()), store)
    }

    fn members() -> Vec<JobConfiguration> {
        vec![
            JobConfiguration::new("sync", JobType::DataSync)
                .with_uid("q0")
                .with_cron("0 0 2 * * *"),
            JobConfiguration::new("analytics", JobType::AnalyticsTable).with_uid("q1"),
            JobConfiguration::new("integrity", JobType::DataIntegrity).with_uid("q2"),
        ]
    }

    #[tokio::test]
    async fn test_create_orders_members() {
        let (queue, _) = queue();
        let stored = queue.create("nightly", members()).await.unwrap();
        assert_eq!(stored[0].scheduling_type, SchedulingType::Cron);
        assert_eq!(stored[1].scheduling_type, SchedulingType::QueueMember);

        let uids: Vec<_> = queue
            .members("nightly")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.uid)
            .collect();
        assert_eq!(uids, vec!["q0", "q1", "q2"]);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_queues() {
        let (queue, _) = queue();
        assert!(queue.create("", members()).await.is_err());
        assert!(queue.create("one", members()[..1].to_vec()).await.is_err());

        let mut unscheduled = members();
        unscheduled[0].cron_expression = None;
        assert!(queue.create("unscheduled", unscheduled).await.is_err());

        queue.create("nightly", members()).await.unwrap();
        let again: Vec<_> = members()
            .into_iter()
            .map(|m| {
                let uid = format!("{}-again", m.uid);
                m.with_uid(uid)
            })
            .collect();
        assert!(queue.create("nightly", again).await.is_err());
    }

    #[tokio::test]
    async fn test_success_hands_over_and_failure_skips() {
        let (queue, store) = queue();
        let stored = queue.create("nightly", members()).await.unwrap();

        let next = queue
            .follow_up(&stored[0], JobStatus::Completed)
            .await
            .unwrap();
        assert_eq!(next.map(|n| n.uid), Some("q1".to_string()));

        let next = queue.follow_up(&stored[1], JobStatus::Failed).await.unwrap();
        assert!(next.is_none());
        let skipped = store.get("q2").await.unwrap().unwrap();
        assert_eq!(skipped.last_executed_status, JobStatus::NotStarted);
        assert_eq!(skipped.job_status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_last_member_ends_round() {
        let (queue, _) = queue();
        let stored = queue.create("nightly", members()).await.unwrap();
        assert!(
            queue
                .follow_up(&stored[2], JobStatus::Completed)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_jobs_outside_queues_have_no_follow_up() {
        let (queue, _) = queue();
        let job = JobConfiguration::new("solo", JobType::Test);
        assert!(queue.follow_up(&job, JobStatus::Failed).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_all_members() {
        let (queue, store) = queue();
        queue.create("nightly", members()).await.unwrap();
        assert_eq!(queue.delete("nightly").await.unwrap(), 3);
        assert!(store.get("q0").await.unwrap().is_none());
    }
}
