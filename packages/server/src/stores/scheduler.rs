//! PostgreSQL scheduler store: jobs, job runs, timers.
//!
//! The unique index on `(job_id, scheduled_time)` plus
//! `ON CONFLICT DO NOTHING` enforces at-most-one run per scheduled instant
//! per job, regardless of how many leaders race a tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use taskmill::id::{CorrelationId, JobId, RunId, TimerId};
use taskmill::scheduler::{
    CronJob, JobRun, MaterializeResult, RunStatus, SchedulerStore, Timer,
};
use taskmill::work_item::WorkItem;

use super::work_queue::{delegate_work_queue_to_field, SqlWorkQueue, WorkItemRow};

const JOB_COLUMNS: &str = "job_id, job_name, cron_schedule, topic, payload, is_enabled, \
     next_due_time, last_run_time, last_run_status";

const RUN_COLUMNS: &str = "id, status, locked_until, owner_token, retry_count, last_error, \
     due_time_utc, created_at, processed_at, run_id, job_id, scheduled_time, start_time, \
     end_time, output";

const TIMER_COLUMNS: &str = "id, status, locked_until, owner_token, retry_count, last_error, \
     due_time_utc, created_at, processed_at, timer_id, due_time, topic, payload, correlation_id";

pub struct PgSchedulerStore {
    /// The shared work-queue operations run against the job-run table.
    runs: SqlWorkQueue,
    schema: String,
}

impl PgSchedulerStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            runs: SqlWorkQueue::new(pool, schema, "job_runs"),
            schema: schema.to_string(),
        }
    }

    fn pool(&self) -> &PgPool {
        self.runs.pool()
    }

    fn row_to_job(row: &PgRow) -> anyhow::Result<CronJob> {
        let status: Option<String> = row.try_get("last_run_status")?;
        Ok(CronJob {
            job_id: JobId::from(row.try_get::<Uuid, _>("job_id")?),
            job_name: row.try_get("job_name")?,
            cron_schedule: row.try_get("cron_schedule")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            is_enabled: row.try_get("is_enabled")?,
            next_due_time: row.try_get("next_due_time")?,
            last_run_time: row.try_get("last_run_time")?,
            last_run_status: status.as_deref().map(run_status_from_sql).transpose()?,
        })
    }

    fn row_to_run(row: &PgRow) -> anyhow::Result<JobRun> {
        let item: WorkItem = WorkItemRow::from_pg_row(row)?;
        Ok(JobRun {
            item,
            run_id: RunId::from(row.try_get::<Uuid, _>("run_id")?),
            job_id: JobId::from(row.try_get::<Uuid, _>("job_id")?),
            scheduled_time: row.try_get("scheduled_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            output: row.try_get("output")?,
        })
    }

    fn row_to_timer(row: &PgRow) -> anyhow::Result<Timer> {
        let item: WorkItem = WorkItemRow::from_pg_row(row)?;
        Ok(Timer {
            item,
            timer_id: TimerId::from(row.try_get::<Uuid, _>("timer_id")?),
            due_time: row.try_get("due_time")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            correlation_id: CorrelationId::from(
                row.try_get::<Option<Uuid>, _>("correlation_id")?,
            ),
        })
    }
}

fn run_status_to_sql(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Poisoned => "poisoned",
    }
}

fn run_status_from_sql(raw: &str) -> anyhow::Result<RunStatus> {
    Ok(match raw {
        "succeeded" => RunStatus::Succeeded,
        "failed" => RunStatus::Failed,
        "poisoned" => RunStatus::Poisoned,
        other => anyhow::bail!("unknown run status {other:?}"),
    })
}

delegate_work_queue_to_field!(PgSchedulerStore, runs);

#[async_trait]
impl SchedulerStore for PgSchedulerStore {
    async fn upsert_job(&self, job: CronJob) -> anyhow::Result<JobId> {
        let id: Uuid = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {schema}.jobs
                (job_id, job_name, cron_schedule, topic, payload, is_enabled, next_due_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_name) DO UPDATE SET
                cron_schedule = EXCLUDED.cron_schedule,
                topic = EXCLUDED.topic,
                payload = EXCLUDED.payload,
                is_enabled = EXCLUDED.is_enabled,
                next_due_time = EXCLUDED.next_due_time
            RETURNING job_id
            "#,
            schema = self.schema,
        ))
        .bind(job.job_id.into_inner())
        .bind(&job.job_name)
        .bind(&job.cron_schedule)
        .bind(&job.topic)
        .bind(&job.payload)
        .bind(job.is_enabled)
        .bind(job.next_due_time)
        .fetch_one(self.pool())
        .await?;
        Ok(JobId::from(id))
    }

    async fn set_job_enabled(&self, job_id: JobId, enabled: bool) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "UPDATE {schema}.jobs SET is_enabled = $2 WHERE job_id = $1",
            schema = self.schema,
        ))
        .bind(job_id.into_inner())
        .bind(enabled)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn list_enabled_jobs(&self) -> anyhow::Result<Vec<CronJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM {schema}.jobs WHERE is_enabled ORDER BY job_name",
            schema = self.schema,
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<CronJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM {schema}.jobs WHERE job_id = $1",
            schema = self.schema,
        ))
        .bind(job_id.into_inner())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_next_due(&self, job_id: JobId, next: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "UPDATE {schema}.jobs SET next_due_time = $2 WHERE job_id = $1",
            schema = self.schema,
        ))
        .bind(job_id.into_inner())
        .bind(next)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn due_jobs(&self) -> anyhow::Result<Vec<CronJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM {schema}.jobs
            WHERE is_enabled AND next_due_time IS NOT NULL AND next_due_time <= NOW()
            ORDER BY job_name
            "#,
            schema = self.schema,
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn record_run_outcome(
        &self,
        job_id: JobId,
        ran_at: DateTime<Utc>,
        status: RunStatus,
    ) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {schema}.jobs
            SET last_run_time = $2, last_run_status = $3
            WHERE job_id = $1
            "#,
            schema = self.schema,
        ))
        .bind(job_id.into_inner())
        .bind(ran_at)
        .bind(run_status_to_sql(status))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn materialize_run(
        &self,
        job_id: JobId,
        scheduled_time: DateTime<Utc>,
    ) -> anyhow::Result<MaterializeResult> {
        let run_id = RunId::new();
        let inserted: Option<Uuid> = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {schema}.job_runs
                (id, status, due_time_utc, created_at, run_id, job_id, scheduled_time)
            VALUES ($1, 'pending', $4, NOW(), $2, $3, $4)
            ON CONFLICT (job_id, scheduled_time) DO NOTHING
            RETURNING run_id
            "#,
            schema = self.schema,
        ))
        .bind(Uuid::new_v4())
        .bind(run_id.into_inner())
        .bind(job_id.into_inner())
        .bind(scheduled_time)
        .fetch_optional(self.pool())
        .await?;

        Ok(match inserted {
            Some(_) => MaterializeResult::Created(run_id),
            None => MaterializeResult::AlreadyExists,
        })
    }

    async fn load_runs(&self, ids: &[Uuid]) -> anyhow::Result<Vec<JobRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM {schema}.job_runs WHERE id = ANY($1) \
             ORDER BY due_time_utc, created_at, id",
            schema = self.schema,
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn runs_for_job(&self, job_id: JobId) -> anyhow::Result<Vec<JobRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM {schema}.job_runs WHERE job_id = $1 \
             ORDER BY scheduled_time",
            schema = self.schema,
        ))
        .bind(job_id.into_inner())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn create_timer(
        &self,
        due_time: DateTime<Utc>,
        topic: &str,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
    ) -> anyhow::Result<TimerId> {
        let timer_id = TimerId::new();
        sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.timers
                (id, status, due_time_utc, created_at, timer_id, due_time, topic, payload,
                 correlation_id)
            VALUES ($1, 'pending', $3, NOW(), $2, $3, $4, $5, $6)
            "#,
            schema = self.schema,
        ))
        .bind(Uuid::new_v4())
        .bind(timer_id.into_inner())
        .bind(due_time)
        .bind(topic)
        .bind(&payload)
        .bind(correlation_id.as_optional())
        .execute(self.pool())
        .await?;
        Ok(timer_id)
    }

    async fn due_timers(&self, limit: usize) -> anyhow::Result<Vec<Timer>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TIMER_COLUMNS}
            FROM {schema}.timers
            WHERE status = 'pending' AND due_time <= NOW()
            ORDER BY due_time
            LIMIT $1
            "#,
            schema = self.schema,
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_timer).collect()
    }

    async fn complete_timer(&self, timer_id: TimerId) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {schema}.timers
            SET status = 'completed', processed_at = NOW()
            WHERE timer_id = $1 AND status = 'pending'
            "#,
            schema = self.schema,
        ))
        .bind(timer_id.into_inner())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_mapping_roundtrips() {
        for status in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Poisoned] {
            assert_eq!(
                run_status_from_sql(run_status_to_sql(status)).unwrap(),
                status
            );
        }
        assert!(run_status_from_sql("pending").is_err());
    }
}
