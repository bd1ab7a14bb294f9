use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::progress::{Failure, FailurePolicy, JobProgress};
use crate::jobs::types::{Job, JobConfiguration, JobType};

fn default_stages() -> u32 {
    1
}

fn default_failure_message() -> String {
    "Simulated failure".to_string()
}

/// Shape of a TEST run, read from the definition's parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestJobParameters {
    #[serde(default = "default_stages")]
    pub stages: u32,

    /// Work items per stage
    #[serde(default)]
    pub items: u32,

    #[serde(default)]
    pub item_duration_ms: u64,

    /// Zero based stage that fails
    #[serde(default)]
    pub fail_at_stage: Option<u32>,

    /// Zero based item of `fail_at_stage` that fails; without it the stage
    /// itself fails
    #[serde(default)]
    pub fail_at_item: Option<u32>,

    /// Return the failure as an error instead of reporting it
    #[serde(default)]
    pub fail_with_error: bool,

    #[serde(default = "default_failure_message")]
    pub failure_message: String,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for TestJobParameters {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            items: 0,
            item_duration_ms: 0,
            fail_at_stage: None,
            fail_at_item: None,
            fail_with_error: false,
            failure_message: default_failure_message(),
            failure_policy: FailurePolicy::Parent,
        }
    }
}

impl TestJobParameters {
    pub fn from_job(job: &JobConfiguration) -> JobResult<Self> {
        match &job.parameters {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| JobError::InvalidParameters(e.to_string())),
            None => Ok(Self::default()),
        }
    }
}

/// Synthetic job that walks through stages and items as configured
#[derive(Debug, Default)]
pub struct TestJob;

#[async_trait]
impl Job for TestJob {
    fn job_type(&self) -> JobType {
        JobType::Test
    }

    async fn execute(&self, job: &JobConfiguration, progress: Arc<dyn JobProgress>) -> JobResult<()> {
        let params = TestJobParameters::from_job(job)?;
        let progress = progress.as_ref();
        let item_duration = Duration::from_millis(params.item_duration_ms);

        progress.starting_process(&format!("Test job '{}'", job.name))?;
        for stage in 0..params.stages {
            progress.starting_stage(
                &format!("Stage {}", stage + 1),
                params.items as usize,
                params.failure_policy,
            )?;

            let failing_stage = params.fail_at_stage == Some(stage);
            if failing_stage && params.fail_with_error {
                return Err(JobError::ExecutionFailed(params.failure_message.clone()));
            }
            if failing_stage && params.fail_at_item.is_none() {
                progress.failed_stage(Failure::new(params.failure_message.clone()));
                continue;
            }

            let failing_item = if failing_stage { params.fail_at_item } else { None };
            let message = params.failure_message.as_str();
            let finished = progress
                .run_stage(
                    0..params.items,
                    |item| format!("Item {}", item + 1),
                    |item| async move {
                        if !item_duration.is_zero() {
                            tokio::time::sleep(item_duration).await;
                        }
                        if failing_item == Some(item) {
                            Err(Failure::new(message))
                        } else {
                            Ok(())
                        }
                    },
                )
                .await;
            if !finished {
                return Err(JobError::Cancelled);
            }
        }

        progress.completed_process(Some(&format!("{} stages processed", params.stages)));
        Ok(())
    }

    fn description(&self) -> Option<String> {
        Some("Walks through configurable stages and items".to_string())
    }
}
