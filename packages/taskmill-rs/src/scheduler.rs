//! Cron jobs, one-shot timers, and materialized job runs.
//!
//! Scheduler workers compete for the coarse `scheduler-leader` lease. The
//! leader advances `next_due_time` on enabled jobs, materializes at most one
//! run per `(job, scheduled_time)`, and fires due timers as outbox messages.
//! Run execution goes through the shared work-queue engine.
//!
//! Cron evaluation is UTC. The public dialect is 5-field; expressions are
//! normalized by prepending a `0` seconds field before parsing. Missed
//! windows are collapsed: the next due time is the first cron instant at or
//! after "now", never a back-fired historical one.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskmillError;
use crate::id::{CorrelationId, JobId, RunId, TimerId};
use crate::work_item::{WorkItem, WorkQueue};

/// Name of the coarse lease scheduler workers compete for.
pub const SCHEDULER_LEADER_LEASE: &str = "scheduler-leader";

// =============================================================================
// Cron evaluation
// =============================================================================

/// A validated cron expression, normalized to the 6-field form the `cron`
/// crate parses.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    /// Parse a 5-field expression (seconds field of `0` is prepended).
    /// 6-field input is tolerated and parsed as-is.
    pub fn parse(expr: &str) -> Result<Self, TaskmillError> {
        let fields = expr.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {expr}"),
            6 => expr.to_string(),
            n => {
                return Err(TaskmillError::invalid_input(format!(
                    "cron expression must have 5 fields, got {n}: {expr:?}"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            TaskmillError::invalid_input(format!("invalid cron expression {expr:?}: {e}"))
        })?;
        Ok(Self {
            source: expr.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First instant strictly after `after`. Collapses missed windows by
    /// construction.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Poisoned,
}

/// A cron job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub job_id: JobId,
    /// Unique per database.
    pub job_name: String,
    pub cron_schedule: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub is_enabled: bool,
    pub next_due_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
}

/// One materialized run of a job. At most one exists per
/// `(job_id, scheduled_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub item: WorkItem,
    pub run_id: RunId,
    pub job_id: JobId,
    pub scheduled_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: Option<String>,
}

/// A one-shot timer; firing emits a downstream outbox message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub item: WorkItem,
    pub timer_id: TimerId,
    pub due_time: DateTime<Utc>,
    pub topic: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
}

// =============================================================================
// Store contract
// =============================================================================

/// Result of a run materialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeResult {
    Created(RunId),
    /// A run already exists for this `(job, scheduled_time)`.
    AlreadyExists,
}

/// Store contract for one database's scheduler tables. Job-run claiming and
/// state transitions come from the shared [`WorkQueue`] operations, which
/// operate on the `JobRuns` table.
#[async_trait]
pub trait SchedulerStore: WorkQueue {
    // --- jobs ---

    async fn upsert_job(&self, job: CronJob) -> anyhow::Result<JobId>;

    async fn set_job_enabled(&self, job_id: JobId, enabled: bool) -> anyhow::Result<()>;

    async fn list_enabled_jobs(&self) -> anyhow::Result<Vec<CronJob>>;

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<CronJob>>;

    async fn update_next_due(&self, job_id: JobId, next: DateTime<Utc>) -> anyhow::Result<()>;

    /// Jobs whose `next_due_time` has passed, per the store's clock.
    async fn due_jobs(&self) -> anyhow::Result<Vec<CronJob>>;

    /// Record the outcome of a finished run on the job row.
    async fn record_run_outcome(
        &self,
        job_id: JobId,
        ran_at: DateTime<Utc>,
        status: RunStatus,
    ) -> anyhow::Result<()>;

    // --- runs ---

    /// Create a `Pending` run for `(job, scheduled_time)` unless one exists.
    async fn materialize_run(
        &self,
        job_id: JobId,
        scheduled_time: DateTime<Utc>,
    ) -> anyhow::Result<MaterializeResult>;

    async fn load_runs(&self, ids: &[uuid::Uuid]) -> anyhow::Result<Vec<JobRun>>;

    async fn runs_for_job(&self, job_id: JobId) -> anyhow::Result<Vec<JobRun>>;

    // --- timers ---

    async fn create_timer(
        &self,
        due_time: DateTime<Utc>,
        topic: &str,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
    ) -> anyhow::Result<TimerId>;

    /// Timers whose due time has passed and which are not yet completed.
    async fn due_timers(&self, limit: usize) -> anyhow::Result<Vec<Timer>>;

    async fn complete_timer(&self, timer_id: TimerId) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_parses() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        assert_eq!(expr.as_str(), "*/5 * * * *");
    }

    #[test]
    fn six_field_expression_is_tolerated() {
        assert!(CronExpr::parse("0 */5 * * * *").is_ok());
    }

    #[test]
    fn wrong_field_count_is_invalid_input() {
        let err = CronExpr::parse("* * *").unwrap_err();
        assert!(matches!(err, TaskmillError::InvalidInput(_)));
    }

    #[test]
    fn garbage_expression_is_invalid_input() {
        assert!(CronExpr::parse("a b c d e").is_err());
    }

    #[test]
    fn next_after_is_strictly_later() {
        let expr = CronExpr::parse("0 * * * *").unwrap(); // top of every hour
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let next = expr.next_after(at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn missed_windows_collapse() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        // Pretend the scheduler slept for three hours; next due is the
        // first instant after "now", not a backlog of 12 windows.
        let woke_at = Utc.with_ymd_and_hms(2026, 3, 1, 13, 7, 0).unwrap();
        let next = expr.next_after(woke_at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 13, 15, 0).unwrap());
    }

    #[test]
    fn cron_evaluates_in_utc() {
        let expr = CronExpr::parse("30 4 * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap();
        let next = expr.next_after(at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 15, 4, 30, 0).unwrap());
    }
}
