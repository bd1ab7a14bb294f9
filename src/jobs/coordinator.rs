//! Cluster-wide single-flight guard for job runs.
//!
//! Every node keeps a local map of the runs it executes and mirrors each of
//! them into the cluster cache under `running:<TYPE>`. The cache entry lives
//! only as long as the owning node keeps heart-beating it, so a crashed node
//! frees its job types once the TTL runs out. Refresh and release compare the
//! stored entry with the bytes this node last wrote, so a node never
//! overwrites or deletes a claim another node has taken in the meantime.
//! Cancellation of a run owned by
//! another node travels through a `cancel:<TYPE>` marker that the owner picks
//! up on its next tick; finished runs leave their progress tree under
//! `completed:<TYPE>`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::{CacheError, CacheManager};
use crate::config::settings::SchedulerConfig;
use crate::jobs::progress::{JobProgress, Progress, RecordingJobProgress};
use crate::jobs::store::JobConfigurationStore;
use crate::jobs::types::JobType;

fn running_key(job_type: JobType) -> String {
    format!("running:{job_type}")
}

fn cancel_key(job_type: JobType) -> String {
    format!("cancel:{job_type}")
}

fn completed_key(job_type: JobType) -> String {
    format!("completed:{job_type}")
}

/// Outcome of [`RunCoordinator::try_start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyRunningLocally,
    AlreadyRunningRemotely,
    /// The cluster cache could not be reached; the run is refused
    Unavailable,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Cluster cache value of a running or completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunEntry {
    node_id: String,
    job_id: String,
    started: DateTime<Utc>,
    progress: Progress,
}

impl RunEntry {
    fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}

/// Bytes of the `running:<TYPE>` entry as this node last wrote them
type Claim = Arc<AsyncMutex<Vec<u8>>>;

struct LocalRun {
    job_id: String,
    started: DateTime<Utc>,
    progress: Arc<RecordingJobProgress>,
    heartbeat: CancellationToken,
    claim: Claim,
}

#[derive(Clone)]
struct CompletedRun {
    started: DateTime<Utc>,
    progress: Progress,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub run_ttl_seconds: u64,
    pub heartbeat_interval: Duration,
    pub completed_ttl_seconds: u64,
}

impl From<&SchedulerConfig> for CoordinatorConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            run_ttl_seconds: config.run_ttl_seconds,
            heartbeat_interval: config.heartbeat_interval(),
            completed_ttl_seconds: config.completed_ttl_seconds,
        }
    }
}

pub struct RunCoordinator {
    node_id: String,
    cache: CacheManager,
    store: Arc<dyn JobConfigurationStore>,
    config: CoordinatorConfig,
    running: DashMap<JobType, LocalRun>,
    completed: DashMap<JobType, CompletedRun>,
    heartbeats: TaskTracker,
}

impl RunCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        cache: CacheManager,
        store: Arc<dyn JobConfigurationStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            cache,
            store,
            config,
            running: DashMap::new(),
            completed: DashMap::new(),
            heartbeats: TaskTracker::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_running_locally(&self, job_type: JobType) -> bool {
        self.running.contains_key(&job_type)
    }

    /// Claim `job_type` for a run on this node
    ///
    /// The local claim is taken first and given back when the cluster claim
    /// fails. Cache errors refuse the run.
    pub async fn try_start(
        &self,
        job_type: JobType,
        job_id: &str,
        progress: Arc<RecordingJobProgress>,
    ) -> Admission {
        let entry = RunEntry {
            node_id: self.node_id.clone(),
            job_id: job_id.to_string(),
            started: Utc::now(),
            progress: progress.snapshot(),
        };
        let bytes = match entry.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(job_type = %job_type, job_id, error = %e, "Could not encode run entry");
                return Admission::Unavailable;
            }
        };

        let heartbeat = CancellationToken::new();
        let claim: Claim = Arc::new(AsyncMutex::new(bytes.clone()));
        match self.running.entry(job_type) {
            Entry::Occupied(_) => return Admission::AlreadyRunningLocally,
            Entry::Vacant(slot) => {
                slot.insert(LocalRun {
                    job_id: job_id.to_string(),
                    started: entry.started,
                    progress: progress.clone(),
                    heartbeat: heartbeat.clone(),
                    claim: claim.clone(),
                });
            }
        }

        let claimed = self
            .cache
            .set_if_absent(
                &running_key(job_type),
                bytes,
                Some(self.config.run_ttl_seconds),
            )
            .await;

        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.running.remove(&job_type);
                tracing::debug!(job_type = %job_type, job_id, "Job type already running on another node");
                return Admission::AlreadyRunningRemotely;
            }
            Err(e) => {
                self.running.remove(&job_type);
                tracing::warn!(job_type = %job_type, job_id, error = %e, "Cluster cache unavailable, run refused");
                return Admission::Unavailable;
            }
        }

        self.spawn_heartbeat(job_type, entry, progress, heartbeat, claim);
        tracing::info!(job_type = %job_type, job_id, node_id = %self.node_id, "Run admitted");
        Admission::Admitted
    }

    fn spawn_heartbeat(
        &self,
        job_type: JobType,
        mut entry: RunEntry,
        progress: Arc<RecordingJobProgress>,
        token: CancellationToken,
        claim: Claim,
    ) {
        let cache = self.cache.clone();
        let store = self.store.clone();
        let ttl = self.config.run_ttl_seconds;
        let period = self.config.heartbeat_interval.max(Duration::from_millis(100));
        let key = running_key(job_type);

        self.heartbeats.spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut stored = claim.lock().await;
                // finish() cancels before it releases under the same lock
                if token.is_cancelled() {
                    break;
                }

                entry.progress = progress.snapshot();
                match refresh_claim(&cache, &key, &stored, &entry, ttl).await {
                    Ok(Some(bytes)) => *stored = bytes,
                    Ok(None) => {
                        tracing::warn!(
                            job_type = %job_type,
                            job_id = %entry.job_id,
                            "Run entry taken over by another node, run cancelled"
                        );
                        progress.request_cancellation();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(job_type = %job_type, error = %e, "Heartbeat could not refresh run entry");
                    }
                }
                drop(stored);

                if let Err(e) = store.assure_running(&entry.job_id).await {
                    tracing::warn!(job_id = %entry.job_id, error = %e, "Heartbeat could not touch job");
                }
                if let Err(e) = store.update_progress(&entry.job_id, &entry.progress).await {
                    tracing::warn!(job_id = %entry.job_id, error = %e, "Heartbeat could not store progress");
                }
            }
        });
    }

    /// Release the claim of a finished run and keep its final progress
    pub async fn finish(&self, job_type: JobType, job_id: &str) {
        let Some((_, run)) = self
            .running
            .remove_if(&job_type, |_, run| run.job_id == job_id)
        else {
            return;
        };
        run.heartbeat.cancel();

        let completed = CompletedRun {
            started: run.started,
            progress: run.progress.snapshot(),
        };
        self.completed
            .entry(job_type)
            .and_modify(|current| {
                if completed.started >= current.started {
                    *current = completed.clone();
                }
            })
            .or_insert_with(|| completed.clone());

        self.publish_completed(job_type, job_id, &completed).await;
        self.release_cluster_entry(job_type, &run.claim).await;
        if let Err(e) = self.cache.remove(&cancel_key(job_type)).await {
            tracing::debug!(job_type = %job_type, error = %e, "Could not clear cancel marker");
        }
    }

    async fn publish_completed(&self, job_type: JobType, job_id: &str, completed: &CompletedRun) {
        let key = completed_key(job_type);
        let newer_exists = match self.cache.get_json::<RunEntry>(&key).await {
            Ok(Some(current)) => current.started > completed.started,
            _ => false,
        };
        if newer_exists {
            return;
        }
        let entry = RunEntry {
            node_id: self.node_id.clone(),
            job_id: job_id.to_string(),
            started: completed.started,
            progress: completed.progress.clone(),
        };
        if let Err(e) = self
            .cache
            .set_json(&key, &entry, Some(self.config.completed_ttl_seconds))
            .await
        {
            tracing::warn!(job_type = %job_type, error = %e, "Could not publish completed progress");
        }
    }

    /// Delete the cluster entry if it is still the one this node wrote
    async fn release_cluster_entry(&self, job_type: JobType, claim: &Claim) {
        let claim = claim.lock().await;
        match self
            .cache
            .compare_and_remove(&running_key(job_type), &claim)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_type = %job_type, "Run entry no longer held by this node");
            }
            Err(e) => {
                tracing::warn!(job_type = %job_type, error = %e, "Could not release run entry");
            }
        }
    }

    /// Request cancellation of the run of `job_type`, wherever it executes
    ///
    /// Returns `false` when the request could not be delivered.
    pub async fn cancel(&self, job_type: JobType) -> bool {
        let local = self
            .running
            .get(&job_type)
            .map(|run| run.progress.clone());
        if let Some(progress) = local {
            progress.request_cancellation();
            return true;
        }

        match self
            .cache
            .set(
                &cancel_key(job_type),
                self.node_id.clone().into_bytes(),
                Some(self.config.run_ttl_seconds),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(job_type = %job_type, "Cancel marker written for remote run");
                true
            }
            Err(e) => {
                tracing::warn!(job_type = %job_type, error = %e, "Could not write cancel marker");
                false
            }
        }
    }

    /// Apply cancel markers that target runs of this node
    ///
    /// Returns the number of runs that were asked to stop.
    pub async fn poll_cancellations(&self) -> usize {
        let local: Vec<(JobType, Arc<RecordingJobProgress>)> = self
            .running
            .iter()
            .map(|run| (*run.key(), run.progress.clone()))
            .collect();

        let mut cancelled = 0;
        for (job_type, progress) in local {
            let key = cancel_key(job_type);
            match self.cache.get(&key).await {
                Ok(Some(_)) => {
                    if progress.request_cancellation() {
                        cancelled += 1;
                    }
                    if let Err(e) = self.cache.remove(&key).await {
                        tracing::debug!(job_type = %job_type, error = %e, "Could not clear cancel marker");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(job_type = %job_type, error = %e, "Could not poll cancel marker");
                }
            }
        }
        cancelled
    }

    /// Progress of the current run of `job_type`, the most recent of the
    /// local and the cluster view
    pub async fn get_running_progress(&self, job_type: JobType) -> Option<Progress> {
        let local = self
            .running
            .get(&job_type)
            .map(|run| run.progress.snapshot());
        let cluster = self.cluster_progress(&running_key(job_type)).await;
        most_recent(local, cluster)
    }

    pub async fn get_completed_progress(&self, job_type: JobType) -> Option<Progress> {
        let local = self
            .completed
            .get(&job_type)
            .map(|run| run.progress.clone());
        let cluster = self.cluster_progress(&completed_key(job_type)).await;
        most_recent(local, cluster)
    }

    async fn cluster_progress(&self, key: &str) -> Option<Progress> {
        match self.cache.get_json::<RunEntry>(key).await {
            Ok(entry) => entry.map(|entry| entry.progress),
            Err(e) => {
                tracing::debug!(key, error = %e, "Could not read progress from cluster cache");
                None
            }
        }
    }

    /// Stop every local run and wait for `workers` to drain
    ///
    /// Runs still going after `timeout` lose their cluster entries so other
    /// nodes can pick the job types up once the store frees them.
    pub async fn shutdown(&self, workers: &TaskTracker, timeout: Duration) {
        for run in self.running.iter() {
            run.progress.request_cancellation();
        }

        workers.close();
        if tokio::time::timeout(timeout, workers.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.running.len(),
                "Worker pool did not drain before the shutdown timeout"
            );
        }

        let leftovers: Vec<JobType> = self.running.iter().map(|run| *run.key()).collect();
        for job_type in leftovers {
            if let Some((_, run)) = self.running.remove(&job_type) {
                run.heartbeat.cancel();
                self.release_cluster_entry(job_type, &run.claim).await;
            }
        }

        self.heartbeats.close();
        self.heartbeats.wait().await;
    }
}

/// Extend our claim, or take the key back if our entry expired
///
/// Returns the bytes now stored, or `None` when another node owns the key.
async fn refresh_claim(
    cache: &CacheManager,
    key: &str,
    current: &[u8],
    entry: &RunEntry,
    ttl: u64,
) -> Result<Option<Vec<u8>>, CacheError> {
    let bytes = entry.to_bytes()?;
    if cache
        .compare_and_set(key, current, bytes.clone(), Some(ttl))
        .await?
    {
        return Ok(Some(bytes));
    }
    if cache.set_if_absent(key, bytes.clone(), Some(ttl)).await? {
        tracing::warn!(key, "Run entry had expired and was reclaimed");
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn most_recent(local: Option<Progress>, cluster: Option<Progress>) -> Option<Progress> {
    match (local, cluster) {
        (Some(local), Some(cluster)) if cluster.updated > local.updated => Some(cluster),
        (Some(local), _) => Some(local),
        (None, cluster) => cluster,
    }
}
