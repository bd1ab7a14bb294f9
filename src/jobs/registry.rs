use std::collections::HashMap;
use std::sync::Arc;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::types::{Job, JobType};

/// Maps each job type to its executable body
///
/// Filled once at node start and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobType, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body under the type it reports; a second body for the
    /// same type replaces the first
    pub fn register<J>(&mut self, job: J) -> &mut Self
    where
        J: Job + 'static,
    {
        self.register_arc(Arc::new(job))
    }

    pub fn register_arc(&mut self, job: Arc<dyn Job>) -> &mut Self {
        let job_type = job.job_type();
        if self.jobs.insert(job_type, job).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing registered job body");
        }
        self
    }

    pub fn get(&self, job_type: JobType) -> JobResult<Arc<dyn Job>> {
        self.jobs
            .get(&job_type)
            .cloned()
            .ok_or(JobError::NoJobBody(job_type))
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.jobs.contains_key(&job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.jobs.keys().copied().collect();
        types.sort();
        types
    }
}
