use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Integer, Jsonb, Text};
use diesel_async::RunQueryDsl;
use diesel_async::pooled_connection::bb8::PooledConnection;
use serde_json::Value as JsonValue;

use super::JobConfigurationStore;
use crate::db::AsyncDbPool;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::progress::Progress;
use crate::jobs::schedule::DueWindow;
use crate::jobs::types::{JobConfiguration, JobStatus, SchedulingType};
use crate::schema::job_configuration;

/// A recurring-less manual run outside any queue
macro_rules! one_off {
    () => {
        "(queue_position IS NULL AND scheduling_type = 'RUN_ONCE' \
         AND cron_expression IS NULL AND delay IS NULL)"
    };
}

/// The scheduling type a definition returns to after a manual run
macro_rules! regular_scheduling_type {
    () => {
        "CASE WHEN cron_expression IS NOT NULL THEN 'CRON' \
         WHEN delay IS NOT NULL THEN 'FIXED_DELAY' \
         WHEN queue_name IS NOT NULL AND queue_position > 0 THEN 'QUEUE_MEMBER' \
         ELSE scheduling_type END"
    };
}

const TRY_RUN: &str = "UPDATE job_configuration j1 \
     SET job_status = 'RUNNING', last_executed = now(), last_alive = now(), \
         progress = NULL, cancel = false \
     WHERE j1.uid = $1 AND j1.enabled AND j1.job_status = 'SCHEDULED' \
       AND NOT EXISTS (SELECT 1 FROM job_configuration j2 \
                       WHERE j2.job_type = j1.job_type AND j2.job_status = 'RUNNING' \
                         AND j2.uid <> j1.uid)";

const TRY_FINISH: &str = concat!(
    "UPDATE job_configuration SET ",
    "last_executed_status = CASE WHEN cancel THEN 'STOPPED' ELSE $2 END, ",
    "last_finished = now(), last_alive = NULL, cancel = false, ",
    "enabled = CASE WHEN ",
    one_off!(),
    " THEN false ELSE enabled END, ",
    "job_status = CASE WHEN NOT enabled OR ",
    one_off!(),
    " THEN 'DISABLED' ELSE 'SCHEDULED' END, ",
    "scheduling_type = ",
    regular_scheduling_type!(),
    " WHERE uid = $1 AND job_status = 'RUNNING'"
);

const TRY_REVERT: &str = "UPDATE job_configuration SET \
     job_status = CASE WHEN enabled THEN 'SCHEDULED' ELSE 'DISABLED' END, \
     last_alive = NULL, cancel = false \
     WHERE uid = $1 AND job_status = 'RUNNING'";

const TRY_CANCEL: &str = concat!(
    "UPDATE job_configuration SET ",
    "cancel = (job_status = 'RUNNING'), ",
    "enabled = CASE WHEN ",
    one_off!(),
    " THEN false ELSE enabled END, ",
    "scheduling_type = ",
    regular_scheduling_type!(),
    ", last_executed_status = CASE WHEN job_status = 'RUNNING' ",
    "THEN last_executed_status ELSE 'STOPPED' END, ",
    "job_status = CASE WHEN job_status <> 'RUNNING' AND (NOT enabled OR ",
    one_off!(),
    ") THEN 'DISABLED' ELSE job_status END",
    " WHERE uid = $1 AND ((job_status = 'RUNNING' AND NOT cancel) ",
    "OR (job_status = 'SCHEDULED' AND scheduling_type = 'RUN_ONCE'))"
);

const TRY_EXECUTE_NOW: &str = "UPDATE job_configuration SET \
     scheduling_type = 'RUN_ONCE', cancel = false, job_status = 'SCHEDULED' \
     WHERE uid = $1 AND enabled AND job_status <> 'RUNNING' \
       AND (scheduling_type <> 'RUN_ONCE' OR last_finished IS NULL)";

const TRY_SKIP_QUEUE: &str = "UPDATE job_configuration SET \
     last_executed_status = 'NOT_STARTED', last_executed = now(), last_finished = now(), \
     progress = NULL \
     WHERE queue_name = $1 AND queue_position > 0 AND job_status = 'SCHEDULED' \
       AND (last_executed IS NULL OR last_executed < \
            (SELECT h.last_executed FROM job_configuration h \
             WHERE h.queue_name = $1 AND h.queue_position = 0))";

const UPDATE_PROGRESS: &str = "UPDATE job_configuration SET progress = $2, \
     last_alive = CASE WHEN job_status = 'RUNNING' THEN now() ELSE last_alive END \
     WHERE uid = $1";

const RESCHEDULE_STALE: &str = concat!(
    "UPDATE job_configuration SET ",
    "enabled = (cron_expression IS NOT NULL OR delay IS NOT NULL OR queue_name IS NOT NULL), ",
    "job_status = CASE WHEN cron_expression IS NOT NULL OR delay IS NOT NULL ",
    "OR queue_name IS NOT NULL THEN 'SCHEDULED' ELSE 'DISABLED' END, ",
    "scheduling_type = ",
    regular_scheduling_type!(),
    ", cancel = false, last_executed_status = 'FAILED', ",
    "last_finished = now(), last_alive = NULL ",
    "WHERE job_status = 'RUNNING' AND (last_alive < now() - make_interval(mins => $1) ",
    "OR (scheduling_type = 'FIXED_DELAY' AND delay IS NOT NULL ",
    "AND now() > last_executed + make_interval(secs => delay * 2)))"
);

const DELETE_FINISHED: &str = concat!(
    "DELETE FROM job_configuration WHERE ",
    one_off!(),
    " AND queue_name IS NULL AND last_finished < now() - make_interval(mins => $1)"
);

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = job_configuration)]
#[diesel(primary_key(uid))]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct JobConfigurationRow {
    uid: String,
    name: String,
    job_type: String,
    scheduling_type: String,
    cron_expression: Option<String>,
    delay: Option<i64>,
    queue_name: Option<String>,
    queue_position: Option<i32>,
    enabled: bool,
    leader_only: bool,
    continuous_execution: bool,
    job_status: String,
    last_executed_status: String,
    last_executed: Option<DateTime<Utc>>,
    last_finished: Option<DateTime<Utc>>,
    last_alive: Option<DateTime<Utc>>,
    cancel: bool,
    parameters: Option<JsonValue>,
    created: DateTime<Utc>,
}

impl From<&JobConfiguration> for JobConfigurationRow {
    fn from(job: &JobConfiguration) -> Self {
        Self {
            uid: job.uid.clone(),
            name: job.name.clone(),
            job_type: job.job_type.to_string(),
            scheduling_type: job.scheduling_type.to_string(),
            cron_expression: job.cron_expression.clone(),
            delay: job.delay,
            queue_name: job.queue_name.clone(),
            queue_position: job.queue_position,
            enabled: job.enabled,
            leader_only: job.leader_only,
            continuous_execution: job.continuous_execution,
            job_status: job.job_status.to_string(),
            last_executed_status: job.last_executed_status.to_string(),
            last_executed: job.last_executed,
            last_finished: job.last_finished,
            last_alive: job.last_alive,
            cancel: job.cancel,
            parameters: job.parameters.clone(),
            created: job.created,
        }
    }
}

impl TryFrom<JobConfigurationRow> for JobConfiguration {
    type Error = JobError;

    fn try_from(row: JobConfigurationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_type: row.job_type.parse()?,
            scheduling_type: row.scheduling_type.parse()?,
            job_status: row.job_status.parse()?,
            last_executed_status: row.last_executed_status.parse()?,
            uid: row.uid,
            name: row.name,
            cron_expression: row.cron_expression,
            delay: row.delay,
            queue_name: row.queue_name,
            queue_position: row.queue_position,
            enabled: row.enabled,
            leader_only: row.leader_only,
            continuous_execution: row.continuous_execution,
            last_executed: row.last_executed,
            last_finished: row.last_finished,
            last_alive: row.last_alive,
            cancel: row.cancel,
            parameters: row.parameters,
            created: row.created,
        })
    }
}

fn to_jobs(rows: Vec<JobConfigurationRow>) -> JobResult<Vec<JobConfiguration>> {
    rows.into_iter().map(JobConfiguration::try_from).collect()
}

/// Job definitions in the `job_configuration` table
///
/// Every state transition is a single conditional statement, so concurrent
/// nodes never both win the same transition.
#[derive(Clone)]
pub struct PgJobStore {
    pool: AsyncDbPool,
}

impl PgJobStore {
    pub fn new(pool: AsyncDbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> JobResult<PooledConnection<'_, diesel_async::AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| JobError::store("acquire connection", e))
    }

    /// Run a conditional update keyed by uid; true when a row changed
    async fn update_by_uid(
        &self,
        operation: &str,
        sql: &'static str,
        uid: &str,
    ) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let changed = diesel::sql_query(sql)
            .bind::<Text, _>(uid)
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store(operation, e))?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl JobConfigurationStore for PgJobStore {
    async fn get(&self, uid: &str) -> JobResult<Option<JobConfiguration>> {
        let mut conn = self.conn().await?;
        let row = job_configuration::table
            .find(uid)
            .select(JobConfigurationRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| JobError::store("get job configuration", e))?;
        row.map(JobConfiguration::try_from).transpose()
    }

    async fn save(&self, job: &JobConfiguration) -> JobResult<()> {
        job.validate()?;
        let row = JobConfigurationRow::from(job);
        let mut conn = self.conn().await?;
        diesel::insert_into(job_configuration::table)
            .values(&row)
            .on_conflict(job_configuration::uid)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("save job configuration", e))?;
        Ok(())
    }

    async fn delete(&self, uid: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(job_configuration::table.find(uid))
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("delete job configuration", e))?;
        Ok(deleted > 0)
    }

    async fn get_progress(&self, uid: &str) -> JobResult<Option<Progress>> {
        let mut conn = self.conn().await?;
        let progress: Option<Option<JsonValue>> = job_configuration::table
            .find(uid)
            .select(job_configuration::progress)
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| JobError::store("get progress", e))?;
        match progress.flatten() {
            Some(json) => Ok(Some(serde_json::from_value(json)?)),
            None => Ok(None),
        }
    }

    async fn get_due_job_configurations(
        &self,
        window: &DueWindow,
    ) -> JobResult<Vec<JobConfiguration>> {
        use crate::schema::job_configuration::dsl;

        let mut conn = self.conn().await?;
        let running_types: HashSet<String> = dsl::job_configuration
            .filter(dsl::job_status.eq(JobStatus::Running.as_str()))
            .select(dsl::job_type)
            .distinct()
            .load::<String>(&mut conn)
            .await
            .map_err(|e| JobError::store("load running job types", e))?
            .into_iter()
            .collect();

        let rows = dsl::job_configuration
            .filter(dsl::enabled.eq(true))
            .filter(dsl::job_status.eq(JobStatus::Scheduled.as_str()))
            .filter(
                dsl::queue_position
                    .is_null()
                    .or(dsl::queue_position.eq(0))
                    .or(dsl::scheduling_type.eq(SchedulingType::RunOnce.as_str())),
            )
            .order((dsl::job_type.asc(), dsl::created.asc()))
            .select(JobConfigurationRow::as_select())
            .load(&mut conn)
            .await
            .map_err(|e| JobError::store("load due job configurations", e))?;

        let candidates = rows
            .into_iter()
            .filter(|row| !running_types.contains(&row.job_type))
            .collect();
        Ok(to_jobs(candidates)?
            .into_iter()
            .filter(|job| window.due_time(job).is_some())
            .collect())
    }

    async fn get_next_in_queue(
        &self,
        queue: &str,
        position: i32,
    ) -> JobResult<Option<JobConfiguration>> {
        let mut conn = self.conn().await?;
        let row = job_configuration::table
            .filter(job_configuration::queue_name.eq(queue))
            .filter(job_configuration::queue_position.eq(position + 1))
            .select(JobConfigurationRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| JobError::store("get next in queue", e))?;
        row.map(JobConfiguration::try_from).transpose()
    }

    async fn try_run(&self, uid: &str) -> JobResult<bool> {
        self.update_by_uid("try run", TRY_RUN, uid).await
    }

    async fn try_finish(&self, uid: &str, status: JobStatus) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let changed = diesel::sql_query(TRY_FINISH)
            .bind::<Text, _>(uid)
            .bind::<Text, _>(status.as_str())
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("try finish", e))?;
        Ok(changed > 0)
    }

    async fn try_revert(&self, uid: &str) -> JobResult<bool> {
        self.update_by_uid("try revert", TRY_REVERT, uid).await
    }

    async fn try_cancel(&self, uid: &str) -> JobResult<bool> {
        self.update_by_uid("try cancel", TRY_CANCEL, uid).await
    }

    async fn try_execute_now(&self, uid: &str) -> JobResult<bool> {
        self.update_by_uid("try execute now", TRY_EXECUTE_NOW, uid).await
    }

    async fn try_skip_queue(&self, queue: &str) -> JobResult<usize> {
        let mut conn = self.conn().await?;
        diesel::sql_query(TRY_SKIP_QUEUE)
            .bind::<Text, _>(queue)
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("try skip queue", e))
    }

    async fn assure_running(&self, uid: &str) -> JobResult<bool> {
        use crate::schema::job_configuration::dsl;

        let mut conn = self.conn().await?;
        let changed = diesel::update(
            dsl::job_configuration
                .filter(dsl::uid.eq(uid))
                .filter(dsl::job_status.eq(JobStatus::Running.as_str())),
        )
        .set(dsl::last_alive.eq(Utc::now()))
        .execute(&mut conn)
        .await
        .map_err(|e| JobError::store("assure running", e))?;
        Ok(changed > 0)
    }

    async fn update_progress(&self, uid: &str, progress: &Progress) -> JobResult<bool> {
        let json = serde_json::to_value(progress)?;
        let mut conn = self.conn().await?;
        let changed = diesel::sql_query(UPDATE_PROGRESS)
            .bind::<Text, _>(uid)
            .bind::<Jsonb, _>(json)
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("update progress", e))?;
        Ok(changed > 0)
    }

    async fn reschedule_stale_jobs(&self, timeout_minutes: i64) -> JobResult<usize> {
        let minutes = i32::try_from(timeout_minutes.max(1)).unwrap_or(i32::MAX);
        let mut conn = self.conn().await?;
        diesel::sql_query(RESCHEDULE_STALE)
            .bind::<Integer, _>(minutes)
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("reschedule stale jobs", e))
    }

    async fn delete_finished_jobs(&self, ttl_minutes: i64) -> JobResult<usize> {
        let minutes = i32::try_from(ttl_minutes.max(1)).unwrap_or(i32::MAX);
        let mut conn = self.conn().await?;
        diesel::sql_query(DELETE_FINISHED)
            .bind::<Integer, _>(minutes)
            .execute(&mut conn)
            .await
            .map_err(|e| JobError::store("delete finished jobs", e))
    }

    async fn update_disabled_jobs(&self) -> JobResult<usize> {
        use crate::schema::job_configuration::dsl;

        let mut conn = self.conn().await?;
        diesel::update(
            dsl::job_configuration
                .filter(dsl::job_status.eq(JobStatus::Scheduled.as_str()))
                .filter(dsl::enabled.eq(false)),
        )
        .set(dsl::job_status.eq(JobStatus::Disabled.as_str()))
        .execute(&mut conn)
        .await
        .map_err(|e| JobError::store("update disabled jobs", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;

    #[test]
    fn test_row_conversion_keeps_every_field() {
        let job = JobConfiguration::new("sync", JobType::DataSync)
            .with_cron("0 */5 * * * *")
            .in_queue("nightly", 0)
            .with_parameters(serde_json::json!({"dry_run": true}))
            .continuous()
            .leader_only();
        let row = JobConfigurationRow::from(&job);
        assert_eq!(row.job_type, "DATA_SYNC");
        assert_eq!(row.scheduling_type, "CRON");

        let back = JobConfiguration::try_from(row).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_row_with_unknown_status_is_rejected() {
        let mut row = JobConfigurationRow::from(&JobConfiguration::new("a", JobType::Test));
        row.job_status = "PAUSED".to_string();
        assert!(JobConfiguration::try_from(row).is_err());
    }

    #[test]
    fn test_conditional_statements_embed_shared_fragments() {
        assert!(TRY_FINISH.contains("scheduling_type = 'RUN_ONCE'"));
        assert!(TRY_FINISH.contains("THEN 'FIXED_DELAY'"));
        assert!(TRY_CANCEL.ends_with("scheduling_type = 'RUN_ONCE'))"));
        assert!(DELETE_FINISHED.contains("make_interval(mins => $1)"));
    }
}
