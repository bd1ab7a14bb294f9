//! One scheduler node: the components of a cluster member wired together.
//!
//! A node owns its run coordinator, worker pool, leader election and
//! scheduling loop. The job store and the cluster cache are shared with the
//! other nodes; with an empty database URL the store lives in memory and the
//! node is expected to run alone.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::CacheManager;
use crate::config::settings::{NotificationConfig, SchedulerConfig, Settings};
use crate::db::{establish_async_connection_pool, run_pending_migrations};
use crate::error::{AppError, AppResult};
use crate::jobs::progress::Progress;
use crate::jobs::tasks::{HousekeepingJob, TestJob};
use crate::jobs::{
    CoordinatorConfig, JobConfiguration, JobConfigurationStore, JobQueue, JobRegistry,
    JobScheduler, JobType, LeaderElection, MemoryJobStore, PgJobStore, RunCoordinator,
    SchedulingLoop, TickReport, WorkerConfig, WorkerPool,
};
use crate::notifications::{
    LogNotifier, NotificationProvider, NotificationSender, Notifier, ProviderNotifier,
    WebhookProvider,
};

/// Shared infrastructure a node is built on
pub struct NodeComponents {
    pub store: Arc<dyn JobConfigurationStore>,
    pub cache: CacheManager,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Node {
    node_id: String,
    scheduler_config: SchedulerConfig,
    store: Arc<dyn JobConfigurationStore>,
    coordinator: Arc<RunCoordinator>,
    scheduler: JobScheduler,
    queue: JobQueue,
    background: TaskTracker,
    background_shutdown: CancellationToken,
}

impl Node {
    /// Build the node described by `settings` and start its scheduling loop
    pub async fn start(settings: &Settings) -> AppResult<Self> {
        let node_id = settings.node.resolve_id();
        tracing::info!(
            node_id = %node_id,
            app_name = %settings.application.name,
            app_version = %settings.application.version,
            "Node starting"
        );

        let components = NodeComponents {
            store: open_store(settings).await?,
            cache: CacheManager::new(settings.cache.clone(), &settings.application.name).await?,
            notifier: build_notifier(&settings.notifications).await?,
        };
        let registry = Self::builtin_registry(&components.store, &settings.scheduler);
        let node = Self::with_components(node_id, &settings.scheduler, components, registry);

        if settings.scheduler.enabled {
            node.scheduler.start().await?;
        } else {
            tracing::warn!(node_id = %node.node_id, "Scheduling loop disabled by configuration");
        }
        Ok(node)
    }

    /// Bodies every node can run
    pub fn builtin_registry(
        store: &Arc<dyn JobConfigurationStore>,
        config: &SchedulerConfig,
    ) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry
            .register(HousekeepingJob::new(store.clone(), config))
            .register(TestJob);
        registry
    }

    /// Wire a node from already opened infrastructure without starting the
    /// scheduling loop
    pub fn with_components(
        node_id: impl Into<String>,
        config: &SchedulerConfig,
        components: NodeComponents,
        registry: JobRegistry,
    ) -> Self {
        let node_id = node_id.into();
        let NodeComponents {
            store,
            cache,
            notifier,
        } = components;

        let background = TaskTracker::new();
        let background_shutdown = CancellationToken::new();
        let notifications =
            NotificationSender::spawn(notifier, &background, background_shutdown.clone());

        let coordinator = Arc::new(RunCoordinator::new(
            node_id.clone(),
            cache.clone(),
            store.clone(),
            CoordinatorConfig::from(config),
        ));
        let workers = WorkerPool::new(
            store.clone(),
            registry,
            coordinator.clone(),
            notifications,
            WorkerConfig::from(config),
        );
        let leader = LeaderElection::new(node_id.clone(), cache, config.leader_ttl_seconds());
        let core = Arc::new(SchedulingLoop::new(
            leader,
            coordinator.clone(),
            store.clone(),
            workers,
            config,
        ));

        Self {
            node_id,
            scheduler_config: config.clone(),
            queue: JobQueue::new(store.clone()),
            store,
            coordinator,
            scheduler: JobScheduler::new(core),
            background,
            background_shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn JobConfigurationStore> {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn is_leader(&self) -> bool {
        self.scheduler.core().leader().is_leader()
    }

    pub async fn save_job(&self, job: &JobConfiguration) -> AppResult<()> {
        self.store.save(job).await?;
        tracing::info!(job_id = %job.uid, job_type = %job.job_type, "Job definition saved");
        Ok(())
    }

    /// Run one scheduling tick right away
    pub async fn tick(&self) -> TickReport {
        self.scheduler.core().tick().await
    }

    /// Start a definition outside its schedule
    pub async fn execute_now(&self, uid: &str) -> AppResult<bool> {
        Ok(self.scheduler.core().execute_now(uid).await?)
    }

    /// Stop the current run of a definition, or withdraw its pending manual run
    pub async fn cancel(&self, uid: &str) -> AppResult<bool> {
        let job = self
            .store
            .get(uid)
            .await?
            .ok_or_else(|| AppError::NotFound {
                entity: "job_configuration".to_string(),
                field: "uid".to_string(),
                value: uid.to_string(),
            })?;
        if !self.store.try_cancel(uid).await? {
            return Ok(false);
        }
        if job.is_running() {
            self.coordinator.cancel(job.job_type).await;
        }
        Ok(true)
    }

    pub async fn running_progress(&self, job_type: JobType) -> Option<Progress> {
        self.coordinator.get_running_progress(job_type).await
    }

    pub async fn completed_progress(&self, job_type: JobType) -> Option<Progress> {
        self.coordinator.get_completed_progress(job_type).await
    }

    /// Stop ticking, stop local runs and flush pending notifications
    pub async fn shutdown(self) -> AppResult<()> {
        tracing::info!(node_id = %self.node_id, "Node shutting down");
        let stopped = self.scheduler.stop().await;

        let workers = self.scheduler.core().workers();
        workers.stop_accepting();
        self.coordinator
            .shutdown(workers.tracker(), self.scheduler_config.shutdown_timeout())
            .await;

        self.background_shutdown.cancel();
        self.background.close();
        if tokio::time::timeout(Duration::from_secs(5), self.background.wait())
            .await
            .is_err()
        {
            tracing::warn!(node_id = %self.node_id, "Pending notifications dropped on shutdown");
        }

        tracing::info!(node_id = %self.node_id, "Node stopped");
        stopped.map_err(AppError::from)
    }
}

async fn open_store(settings: &Settings) -> AppResult<Arc<dyn JobConfigurationStore>> {
    if !settings.database.is_configured() {
        tracing::warn!("No database configured, job definitions are kept in memory");
        return Ok(Arc::new(MemoryJobStore::new()));
    }

    if settings.database.auto_migrate {
        let applied = run_pending_migrations(&settings.database.url).await?;
        if !applied.is_empty() {
            tracing::info!(migrations = ?applied, "Applied pending migrations");
        }
    }
    let pool = establish_async_connection_pool(&settings.database).await?;
    tracing::info!(
        max_connections = settings.database.max_connections,
        "Database connection pool initialized"
    );
    Ok(Arc::new(PgJobStore::new(pool)))
}

async fn build_notifier(config: &NotificationConfig) -> AppResult<Arc<dyn Notifier>> {
    if !config.enabled {
        return Ok(Arc::new(LogNotifier));
    }
    let provider = WebhookProvider::new(config.webhook.clone())?;
    provider.validate_config().await?;
    tracing::info!(provider = provider.name(), "Notifications enabled");
    Ok(Arc::new(ProviderNotifier::new(Arc::new(provider))))
}
