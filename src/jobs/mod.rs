//! Job definitions, their scheduling and their execution across the cluster

pub mod coordinator;
pub mod error;
pub mod leader;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod types;
pub mod worker;

pub use coordinator::{Admission, CoordinatorConfig, RunCoordinator};
pub use error::{JobError, JobResult};
pub use leader::LeaderElection;
pub use progress::{JobProgress, Progress, RecordingJobProgress};
pub use queue::JobQueue;
pub use registry::JobRegistry;
pub use schedule::{DueWindow, next_execution_time, parse_cron};
pub use scheduler::{JobScheduler, SchedulingLoop, TickReport};
pub use store::{JobConfigurationStore, MemoryJobStore, PgJobStore};
pub use types::{Job, JobConfiguration, JobStatus, JobType, SchedulingType};
pub use worker::{WorkerConfig, WorkerPool};
