use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::progress::JobProgress;

/// Implements `as_str`, `Display` and `FromStr` over the SCREAMING_SNAKE_CASE
/// names that are also used in the database and the cluster cache keys.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = JobError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(JobError::InvalidParameters(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Kind of work a job definition runs; exactly one body is registered per type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Housekeeping,
    DataSync,
    AnalyticsTable,
    DataIntegrity,
    MetadataImport,
    Test,
}

string_enum!(JobType {
    Housekeeping => "HOUSEKEEPING",
    DataSync => "DATA_SYNC",
    AnalyticsTable => "ANALYTICS_TABLE",
    DataIntegrity => "DATA_INTEGRITY",
    MetadataImport => "METADATA_IMPORT",
    Test => "TEST",
});

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Housekeeping,
        JobType::DataSync,
        JobType::AnalyticsTable,
        JobType::DataIntegrity,
        JobType::MetadataImport,
        JobType::Test,
    ];

    /// Whether a failed run of this type sends an error notification
    pub fn uses_error_notification(&self) -> bool {
        !matches!(self, JobType::Housekeeping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulingType {
    Cron,
    FixedDelay,
    RunOnce,
    QueueMember,
}

string_enum!(SchedulingType {
    Cron => "CRON",
    FixedDelay => "FIXED_DELAY",
    RunOnce => "RUN_ONCE",
    QueueMember => "QUEUE_MEMBER",
});

/// Status of a job definition. `Completed`, `Failed`, `Stopped` and
/// `NotStarted` only appear as `last_executed_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Running,
    Disabled,
    Stopped,
    Completed,
    Failed,
    NotStarted,
}

string_enum!(JobStatus {
    Scheduled => "SCHEDULED",
    Running => "RUNNING",
    Disabled => "DISABLED",
    Stopped => "STOPPED",
    Completed => "COMPLETED",
    Failed => "FAILED",
    NotStarted => "NOT_STARTED",
});

impl JobStatus {
    pub fn is_terminal_outcome(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped | JobStatus::NotStarted
        )
    }
}

/// A persisted job definition, referenced by `uid`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    pub uid: String,
    pub name: String,
    pub job_type: JobType,
    pub scheduling_type: SchedulingType,
    pub cron_expression: Option<String>,
    /// Seconds between the end of one run and the start of the next
    pub delay: Option<i64>,
    pub queue_name: Option<String>,
    pub queue_position: Option<i32>,
    pub enabled: bool,
    /// Manual runs of this definition only start on the leader node
    pub leader_only: bool,
    /// Runs through the per-type drain worker instead of the once-per-tick path
    pub continuous_execution: bool,
    pub job_status: JobStatus,
    pub last_executed_status: JobStatus,
    pub last_executed: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_alive: Option<DateTime<Utc>>,
    pub cancel: bool,
    pub parameters: Option<JsonValue>,
    pub created: DateTime<Utc>,
}

impl JobConfiguration {
    /// A one-off definition, due as soon as it is saved
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().simple().to_string(),
            name: name.into(),
            job_type,
            scheduling_type: SchedulingType::RunOnce,
            cron_expression: None,
            delay: None,
            queue_name: None,
            queue_position: None,
            enabled: true,
            leader_only: false,
            continuous_execution: false,
            job_status: JobStatus::Scheduled,
            last_executed_status: JobStatus::NotStarted,
            last_executed: None,
            last_finished: None,
            last_alive: None,
            cancel: false,
            parameters: None,
            created: Utc::now(),
        }
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        if self.scheduling_type != SchedulingType::QueueMember {
            self.scheduling_type = SchedulingType::Cron;
        }
        self
    }

    pub fn with_delay(mut self, seconds: i64) -> Self {
        self.delay = Some(seconds);
        if self.scheduling_type != SchedulingType::QueueMember {
            self.scheduling_type = SchedulingType::FixedDelay;
        }
        self
    }

    /// Place the definition in a queue. Position 0 is the head and keeps its
    /// own schedule; later positions only run when chained.
    pub fn in_queue(mut self, queue: impl Into<String>, position: i32) -> Self {
        self.queue_name = Some(queue.into());
        self.queue_position = Some(position);
        if position > 0 {
            self.scheduling_type = SchedulingType::QueueMember;
        }
        self
    }

    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn continuous(mut self) -> Self {
        self.continuous_execution = true;
        self
    }

    pub fn leader_only(mut self) -> Self {
        self.leader_only = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// A manual run without any recurring schedule; disabled once it finished
    pub fn is_one_off(&self) -> bool {
        self.queue_position.is_none()
            && self.scheduling_type == SchedulingType::RunOnce
            && self.cron_expression.is_none()
            && self.delay.is_none()
    }

    /// Member of a queue behind the head
    pub fn is_queue_follower(&self) -> bool {
        self.queue_name.is_some() && self.queue_position.is_some_and(|p| p > 0)
    }

    pub fn is_running(&self) -> bool {
        self.job_status == JobStatus::Running
    }

    /// The scheduling type a definition falls back to after a manual run
    pub fn regular_scheduling_type(&self) -> SchedulingType {
        if self.cron_expression.is_some() {
            SchedulingType::Cron
        } else if self.delay.is_some() {
            SchedulingType::FixedDelay
        } else if self.is_queue_follower() {
            SchedulingType::QueueMember
        } else {
            self.scheduling_type
        }
    }

    pub fn validate(&self) -> JobResult<()> {
        match self.scheduling_type {
            SchedulingType::Cron => {
                let expression = self.cron_expression.as_deref().ok_or_else(|| {
                    JobError::InvalidCronExpression("missing cron expression".to_string())
                })?;
                crate::jobs::schedule::parse_cron(expression)?;
            }
            SchedulingType::FixedDelay => match self.delay {
                Some(delay) if delay > 0 => {}
                _ => {
                    return Err(JobError::InvalidParameters(
                        "fixed delay must be a positive number of seconds".to_string(),
                    ));
                }
            },
            SchedulingType::QueueMember => {
                if !self.is_queue_follower() {
                    return Err(JobError::InvalidParameters(
                        "queue member needs a queue name and a position > 0".to_string(),
                    ));
                }
            }
            SchedulingType::RunOnce => {}
        }
        if self.queue_position.is_some() != self.queue_name.is_some() {
            return Err(JobError::InvalidParameters(
                "queue name and position must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// The executable body of a job type
///
/// Returning normally completes every node the body left open; returning an
/// error (or panicking) fails the run.
#[async_trait]
pub trait Job: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, job: &JobConfiguration, progress: Arc<dyn JobProgress>)
    -> JobResult<()>;

    fn description(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trips_through_its_name() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
        assert!("NOPE".parse::<JobType>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&JobStatus::NotStarted).unwrap();
        assert_eq!(json, "\"NOT_STARTED\"");
        let json = serde_json::to_string(&SchedulingType::FixedDelay).unwrap();
        assert_eq!(json, "\"FIXED_DELAY\"");
    }

    #[test]
    fn test_builder_sets_scheduling_type() {
        let job = JobConfiguration::new("a", JobType::Test);
        assert!(job.is_one_off());

        let job = JobConfiguration::new("b", JobType::Test).with_cron("0 * * * * *");
        assert_eq!(job.scheduling_type, SchedulingType::Cron);
        assert!(!job.is_one_off());

        let job = JobConfiguration::new("c", JobType::Test).in_queue("q", 2);
        assert_eq!(job.scheduling_type, SchedulingType::QueueMember);
        assert!(job.is_queue_follower());

        let job = JobConfiguration::new("d", JobType::Test)
            .with_cron("0 0 * * * *")
            .in_queue("q", 0);
        assert_eq!(job.scheduling_type, SchedulingType::Cron);
        assert!(!job.is_queue_follower());
    }

    #[test]
    fn test_validate() {
        assert!(
            JobConfiguration::new("a", JobType::Test)
                .with_cron("not a cron")
                .validate()
                .is_err()
        );
        assert!(
            JobConfiguration::new("b", JobType::Test)
                .with_delay(0)
                .validate()
                .is_err()
        );
        assert!(
            JobConfiguration::new("c", JobType::Test)
                .with_delay(30)
                .validate()
                .is_ok()
        );
        assert!(
            JobConfiguration::new("d", JobType::Test)
                .in_queue("q", 1)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_regular_scheduling_type_after_manual_run() {
        let mut job = JobConfiguration::new("a", JobType::Test).with_delay(60);
        job.scheduling_type = SchedulingType::RunOnce;
        assert_eq!(job.regular_scheduling_type(), SchedulingType::FixedDelay);
    }
}
