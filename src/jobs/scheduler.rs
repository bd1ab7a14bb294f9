use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler as TokioCronScheduler};

use crate::config::settings::SchedulerConfig;
use crate::jobs::coordinator::RunCoordinator;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::leader::LeaderElection;
use crate::jobs::schedule::DueWindow;
use crate::jobs::store::JobConfigurationStore;
use crate::jobs::types::{JobConfiguration, JobType};
use crate::jobs::worker::WorkerPool;

/// What one tick of the scheduling loop did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub leader: bool,
    /// Local runs stopped by cancel markers from other nodes
    pub cancelled: usize,
    pub due: usize,
    pub dispatched: usize,
}

/// One iteration of the scheduler, run on every node at a fixed interval
///
/// All nodes apply cancel markers for their own runs. Only the leader looks
/// for due definitions and dispatches them to its worker pool.
pub struct SchedulingLoop {
    leader: LeaderElection,
    coordinator: Arc<RunCoordinator>,
    store: Arc<dyn JobConfigurationStore>,
    workers: WorkerPool,
    loop_interval: Duration,
    max_catch_up: chrono::Duration,
    ticking: AtomicBool,
}

impl SchedulingLoop {
    pub fn new(
        leader: LeaderElection,
        coordinator: Arc<RunCoordinator>,
        store: Arc<dyn JobConfigurationStore>,
        workers: WorkerPool,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            leader,
            coordinator,
            store,
            workers,
            loop_interval: config.loop_interval(),
            max_catch_up: config.max_catch_up(),
            ticking: AtomicBool::new(false),
        }
    }

    pub fn loop_interval(&self) -> Duration {
        self.loop_interval
    }

    pub fn leader(&self) -> &LeaderElection {
        &self.leader
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub async fn tick(&self) -> TickReport {
        if self.ticking.swap(true, Ordering::SeqCst) {
            tracing::debug!("Previous tick still in progress, tick skipped");
            return TickReport::default();
        }
        let report = self.run_tick().await;
        self.ticking.store(false, Ordering::SeqCst);
        report
    }

    async fn run_tick(&self) -> TickReport {
        let mut report = TickReport {
            cancelled: self.coordinator.poll_cancellations().await,
            ..TickReport::default()
        };

        report.leader = self.leader.try_acquire_or_renew().await;
        if !report.leader {
            return report;
        }

        let window = DueWindow::new(
            Utc::now(),
            chrono::Duration::from_std(self.loop_interval).unwrap_or(chrono::Duration::zero()),
            self.max_catch_up,
        );
        let due = match self.store.get_due_job_configurations(&window).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Could not load due job definitions");
                return report;
            }
        };
        report.due = due.len();

        let mut by_type: BTreeMap<JobType, Vec<JobConfiguration>> = BTreeMap::new();
        for job in due {
            by_type.entry(job.job_type).or_default().push(job);
        }

        for (job_type, jobs) in by_type {
            let (continuous, ordinary): (Vec<_>, Vec<_>) =
                jobs.into_iter().partition(|job| job.continuous_execution);

            for job in continuous {
                let due_at = window.due_time(&job).unwrap_or(window.now);
                self.workers.dispatch(job, due_at);
                report.dispatched += 1;
            }

            if self.coordinator.is_running_locally(job_type) {
                continue;
            }
            if let Some(job) = ordinary.into_iter().next() {
                let due_at = window.due_time(&job).unwrap_or(window.now);
                tracing::debug!(job_id = %job.uid, job_type = %job_type, due = %due_at, "Dispatching due job");
                self.workers.dispatch(job, due_at);
                report.dispatched += 1;
            }
        }

        if report.dispatched > 0 {
            tracing::debug!(due = report.due, dispatched = report.dispatched, "Scheduling tick");
        }
        report
    }

    /// Run a definition right away, outside its schedule
    ///
    /// Leader-only definitions requested on another node are only marked and
    /// started by the leader's next tick.
    pub async fn execute_now(&self, uid: &str) -> JobResult<bool> {
        if !self.store.try_execute_now(uid).await? {
            return Ok(false);
        }
        let job = self
            .store
            .get(uid)
            .await?
            .ok_or_else(|| JobError::NotFound(uid.to_string()))?;

        if job.leader_only && !self.leader.is_leader() {
            tracing::info!(job_id = uid, "Manual run left to the leader");
            return Ok(true);
        }
        self.workers.dispatch(job, Utc::now());
        Ok(true)
    }
}

/// Drives [`SchedulingLoop::tick`] with tokio-cron-scheduler
pub struct JobScheduler {
    core: Arc<SchedulingLoop>,
    scheduler: Mutex<Option<TokioCronScheduler>>,
}

impl JobScheduler {
    pub fn new(core: Arc<SchedulingLoop>) -> Self {
        Self {
            core,
            scheduler: Mutex::new(None),
        }
    }

    pub fn core(&self) -> &Arc<SchedulingLoop> {
        &self.core
    }

    /// Run a first tick and then keep ticking every loop interval
    pub async fn start(&self) -> JobResult<()> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let scheduler = TokioCronScheduler::new()
            .await
            .map_err(|e| JobError::Scheduler(e.to_string()))?;

        let core = Arc::clone(&self.core);
        let tick = Job::new_repeated_async(self.core.loop_interval(), move |_uuid, _lock| {
            let core = Arc::clone(&core);
            Box::pin(async move {
                core.tick().await;
            })
        })
        .map_err(|e| JobError::Scheduler(e.to_string()))?;

        scheduler
            .add(tick)
            .await
            .map_err(|e| JobError::Scheduler(e.to_string()))?;

        self.core.tick().await;
        scheduler
            .start()
            .await
            .map_err(|e| JobError::Scheduler(e.to_string()))?;

        tracing::info!(
            interval_secs = self.core.loop_interval().as_secs(),
            "Scheduling loop started"
        );
        *slot = Some(scheduler);
        Ok(())
    }

    /// Stop ticking and hand leadership over
    pub async fn stop(&self) -> JobResult<()> {
        let Some(mut scheduler) = self.scheduler.lock().await.take() else {
            return Ok(());
        };
        scheduler
            .shutdown()
            .await
            .map_err(|e| JobError::Scheduler(e.to_string()))?;
        self.core.leader().resign().await;
        tracing::info!("Scheduling loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AppCache, CacheConfig, CacheManager, MemoryCache, MemoryCacheConfig};
    use crate::jobs::coordinator::CoordinatorConfig;
    use crate::jobs::progress::JobProgress;
    use crate::jobs::registry::JobRegistry;
    use crate::jobs::store::MemoryJobStore;
    use crate::jobs::types::{Job, JobStatus};
    use crate::jobs::worker::WorkerConfig;
    use crate::notifications::NotificationSender;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Counting(JobType, Arc<AtomicUsize>);

    #[async_trait]
    impl Job for Counting {
        fn job_type(&self) -> JobType {
            self.0
        }

        async fn execute(
            &self,
            _job: &JobConfiguration,
            progress: Arc<dyn JobProgress>,
        ) -> JobResult<()> {
            progress.starting_process("count")?;
            self.1.fetch_add(1, Ordering::SeqCst);
            progress.completed_process(None);
            Ok(())
        }
    }

    struct Node {
        core: SchedulingLoop,
        runs: Arc<AtomicUsize>,
    }

    fn node(
        name: &str,
        cache: &Arc<dyn AppCache>,
        store: &Arc<dyn JobConfigurationStore>,
    ) -> Node {
        let cache = CacheManager::from_backend(cache.clone(), CacheConfig::default());
        let config = SchedulerConfig::default();
        let coordinator = Arc::new(RunCoordinator::new(
            name,
            cache.clone(),
            store.clone(),
            CoordinatorConfig::from(&config),
        ));
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        registry
            .register(Counting(JobType::Test, runs.clone()))
            .register(Counting(JobType::DataSync, runs.clone()));
        let workers = WorkerPool::new(
            store.clone(),
            registry,
            coordinator.clone(),
            NotificationSender::disabled(),
            WorkerConfig::default(),
        );
        let leader = LeaderElection::new(name, cache, config.leader_ttl_seconds());
        Node {
            core: SchedulingLoop::new(leader, coordinator, store.clone(), workers, &config),
            runs,
        }
    }

    fn cluster() -> (Arc<dyn AppCache>, Arc<dyn JobConfigurationStore>) {
        let cache: Arc<dyn AppCache> = Arc::new(MemoryCache::new(&MemoryCacheConfig {
            max_size: 64,
            ttl_seconds: 60,
        }));
        (cache, Arc::new(MemoryJobStore::new()))
    }

    async fn drain(node: &Node) {
        node.core.workers().tracker().close();
        node.core.workers().tracker().wait().await;
    }

    #[tokio::test]
    async fn test_only_leader_dispatches() {
        let (cache, store) = cluster();
        let a = node("a", &cache, &store);
        let b = node("b", &cache, &store);
        store
            .save(&JobConfiguration::new("once", JobType::Test))
            .await
            .unwrap();

        let first = a.core.tick().await;
        let second = b.core.tick().await;
        assert!(first.leader);
        assert_eq!(first.dispatched, 1);
        assert!(!second.leader);
        assert_eq!(second.dispatched, 0);

        drain(&a).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 1);
        assert_eq!(b.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_ordinary_run_per_type_per_tick() {
        let (cache, store) = cluster();
        let a = node("a", &cache, &store);
        for name in ["one", "two"] {
            store
                .save(&JobConfiguration::new(name, JobType::Test))
                .await
                .unwrap();
        }
        store
            .save(&JobConfiguration::new("sync", JobType::DataSync))
            .await
            .unwrap();

        let report = a.core.tick().await;
        assert_eq!(report.due, 3);
        assert_eq!(report.dispatched, 2);
    }

    #[tokio::test]
    async fn test_continuous_definitions_all_dispatched() {
        let (cache, store) = cluster();
        let a = node("a", &cache, &store);
        for name in ["one", "two", "three"] {
            store
                .save(&JobConfiguration::new(name, JobType::Test).continuous())
                .await
                .unwrap();
        }

        let report = a.core.tick().await;
        assert_eq!(report.dispatched, 3);
        drain(&a).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_now_runs_scheduled_definition() {
        let (cache, store) = cluster();
        let a = node("a", &cache, &store);
        let job = JobConfiguration::new("nightly", JobType::DataSync).with_cron("0 0 3 * * *");
        store.save(&job).await.unwrap();

        assert!(a.core.execute_now(&job.uid).await.unwrap());
        drain(&a).await;

        let stored = store.get(&job.uid).await.unwrap().unwrap();
        assert_eq!(stored.last_executed_status, JobStatus::Completed);
        assert_eq!(stored.job_status, JobStatus::Scheduled);
        assert!(stored.enabled);
    }

    #[tokio::test]
    async fn test_execute_now_of_leader_only_job_waits_for_leader() {
        let (cache, store) = cluster();
        let a = node("a", &cache, &store);
        let b = node("b", &cache, &store);
        a.core.tick().await;
        b.core.tick().await;

        let job = JobConfiguration::new("nightly", JobType::DataSync)
            .with_cron("0 0 3 * * *")
            .leader_only();
        store.save(&job).await.unwrap();

        assert!(b.core.execute_now(&job.uid).await.unwrap());
        drain(&b).await;
        assert_eq!(b.runs.load(Ordering::SeqCst), 0);

        let report = a.core.tick().await;
        assert_eq!(report.dispatched, 1);
        drain(&a).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_now_of_unknown_definition() {
        let (cache, store) = cluster();
        let a = node("a", &cache, &store);
        assert!(!a.core.execute_now("missing").await.unwrap());
    }
}
