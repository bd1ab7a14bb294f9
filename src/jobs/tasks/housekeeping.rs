use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::settings::SchedulerConfig;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::progress::{Failure, FailurePolicy, JobProgress};
use crate::jobs::store::JobConfigurationStore;
use crate::jobs::types::{Job, JobConfiguration, JobType};

/// Per-definition overrides of the configured sweep limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HousekeepingParameters {
    #[serde(default)]
    pub stale_timeout_minutes: Option<i64>,
    #[serde(default)]
    pub finished_ttl_minutes: Option<i64>,
}

/// Repairs definitions the scheduler cannot repair on its own: runs whose
/// node died, finished one-off runs, and disabled definitions still marked
/// scheduled
pub struct HousekeepingJob {
    store: Arc<dyn JobConfigurationStore>,
    stale_timeout_minutes: i64,
    finished_ttl_minutes: i64,
}

impl HousekeepingJob {
    pub fn new(store: Arc<dyn JobConfigurationStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            stale_timeout_minutes: config.stale_timeout_minutes as i64,
            finished_ttl_minutes: config.finished_ttl_minutes as i64,
        }
    }

    fn parameters(&self, job: &JobConfiguration) -> JobResult<(i64, i64)> {
        let overrides: HousekeepingParameters = match &job.parameters {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| JobError::InvalidParameters(e.to_string()))?,
            None => HousekeepingParameters::default(),
        };
        Ok((
            overrides
                .stale_timeout_minutes
                .unwrap_or(self.stale_timeout_minutes),
            overrides
                .finished_ttl_minutes
                .unwrap_or(self.finished_ttl_minutes),
        ))
    }
}

async fn sweep<Fut>(progress: &dyn JobProgress, description: &str, operation: Fut) -> JobResult<()>
where
    Fut: Future<Output = JobResult<usize>>,
{
    progress.starting_stage(description, 0, FailurePolicy::SkipStage)?;
    match operation.await {
        Ok(count) => progress.completed_stage(Some(&format!("{count} definitions"))),
        Err(e) => progress.failed_stage(Failure::from(&e)),
    }
    Ok(())
}

#[async_trait]
impl Job for HousekeepingJob {
    fn job_type(&self) -> JobType {
        JobType::Housekeeping
    }

    async fn execute(&self, job: &JobConfiguration, progress: Arc<dyn JobProgress>) -> JobResult<()> {
        let (stale_timeout, finished_ttl) = self.parameters(job)?;
        let progress = progress.as_ref();

        progress.starting_process("Housekeeping")?;
        sweep(
            progress,
            "Reschedule stale jobs",
            self.store.reschedule_stale_jobs(stale_timeout),
        )
        .await?;
        sweep(
            progress,
            "Delete finished one-off jobs",
            self.store.delete_finished_jobs(finished_ttl),
        )
        .await?;
        sweep(
            progress,
            "Update disabled jobs",
            self.store.update_disabled_jobs(),
        )
        .await?;
        progress.completed_process(None);

        tracing::debug!(job_id = %job.uid, stale_timeout, finished_ttl, "Housekeeping finished");
        Ok(())
    }

    fn description(&self) -> Option<String> {
        Some(format!(
            "Reschedule jobs without heartbeat for {} minutes and delete one-off jobs finished {} minutes ago",
            self.stale_timeout_minutes, self.finished_ttl_minutes
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::progress::{RecordingJobProgress, Status};
    use crate::jobs::store::MemoryJobStore;
    use crate::jobs::types::JobStatus;
    use chrono::{Duration, Utc};
    use serde_json::json;

    async fn run(
        store: Arc<dyn JobConfigurationStore>,
        job: JobConfiguration,
    ) -> Arc<RecordingJobProgress> {
        let body = HousekeepingJob::new(store, &SchedulerConfig::default());
        let progress = Arc::new(RecordingJobProgress::new(&job));
        body.execute(&job, progress.clone()).await.unwrap();
        progress
    }

    #[tokio::test]
    async fn test_sweeps_run_as_stages() {
        let store: Arc<dyn JobConfigurationStore> = Arc::new(MemoryJobStore::new());
        let long_ago = Utc::now() - Duration::hours(2);

        let mut stale = JobConfiguration::new("stale", JobType::DataSync).with_cron("0 0 * * * *");
        stale.job_status = JobStatus::Running;
        stale.last_alive = Some(long_ago);
        store.save(&stale).await.unwrap();

        let mut finished = JobConfiguration::new("finished", JobType::Test).disabled();
        finished.job_status = JobStatus::Disabled;
        finished.last_finished = Some(Utc::now() - Duration::days(3));
        store.save(&finished).await.unwrap();

        let switched_off = JobConfiguration::new("off", JobType::AnalyticsTable)
            .with_cron("0 0 4 * * *")
            .disabled();
        store.save(&switched_off).await.unwrap();

        let progress = run(store.clone(), JobConfiguration::new("hk", JobType::Housekeeping)).await;

        let tree = progress.snapshot();
        let stages = &tree.processes[0].stages;
        assert_eq!(stages.len(), 3);
        assert!(stages.iter().all(|s| s.node.status == Status::Success));

        let stale = store.get(&stale.uid).await.unwrap().unwrap();
        assert_eq!(stale.job_status, JobStatus::Scheduled);
        assert_eq!(stale.last_executed_status, JobStatus::Failed);
        assert!(store.get(&finished.uid).await.unwrap().is_none());
        assert_eq!(
            store.get(&switched_off.uid).await.unwrap().unwrap().job_status,
            JobStatus::Disabled
        );
    }

    #[tokio::test]
    async fn test_parameters_override_configuration() {
        let store: Arc<dyn JobConfigurationStore> = Arc::new(MemoryJobStore::new());
        let body = HousekeepingJob::new(store, &SchedulerConfig::default());
        let job = JobConfiguration::new("hk", JobType::Housekeeping)
            .with_parameters(json!({ "stale_timeout_minutes": 3 }));
        assert_eq!(body.parameters(&job).unwrap(), (3, 1440));

        let broken = JobConfiguration::new("hk", JobType::Housekeeping)
            .with_parameters(json!({ "stale_timeout_minutes": "soon" }));
        assert!(matches!(
            body.parameters(&broken),
            Err(JobError::InvalidParameters(_))
        ));
    }
}
