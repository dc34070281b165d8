//! Scheduler worker: leader ticks and run execution.
//!
//! Workers compete for the `scheduler-leader` coarse lease. Only the
//! leader advances job due times, materializes runs, and fires timers; any
//! worker may execute claimed runs. Timer firings and run executions
//! enqueue outbox messages with deterministic message ids, so a crash
//! between enqueue and state update dedupes on retry instead of
//! double-publishing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskmill::id::{MessageId, OwnerToken};
use taskmill::lease::CoarseLeaseStore;
use taskmill::metrics::MetricRecorder;
use taskmill::outbox::{EnqueueOptions, OutboxStore};
use taskmill::scheduler::{
    CronExpr, MaterializeResult, RunStatus, SchedulerStore, SCHEDULER_LEADER_LEASE,
};
use taskmill::work_item::WorkQueue;

use crate::kernel::service_host::Service;
use crate::workers::idle_sleep;

#[derive(Clone)]
pub struct SchedulerWorkerConfig {
    pub tick_interval: Duration,
    pub leader_lease: Duration,
    pub run_batch_size: usize,
    pub run_lease: Duration,
    pub timer_batch_size: usize,
    /// Completed outbox rows and idempotency keys older than this are swept
    /// on leader ticks.
    pub retention: chrono::Duration,
}

impl Default for SchedulerWorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            leader_lease: Duration::from_secs(30),
            run_batch_size: 25,
            run_lease: Duration::from_secs(60),
            timer_batch_size: 100,
            retention: chrono::Duration::days(7),
        }
    }
}

pub struct SchedulerWorker {
    scheduler: Arc<dyn SchedulerStore>,
    outbox: Arc<dyn OutboxStore>,
    leases: Arc<dyn CoarseLeaseStore>,
    config: SchedulerWorkerConfig,
    owner: OwnerToken,
    worker_id: String,
    metrics: Arc<dyn MetricRecorder>,
}

impl SchedulerWorker {
    pub fn new(
        scheduler: Arc<dyn SchedulerStore>,
        outbox: Arc<dyn OutboxStore>,
        leases: Arc<dyn CoarseLeaseStore>,
        config: SchedulerWorkerConfig,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        let owner = OwnerToken::new();
        Self {
            scheduler,
            outbox,
            leases,
            config,
            owner,
            worker_id: format!("scheduler-{owner}"),
            metrics,
        }
    }

    /// One leader tick: advance due times, materialize runs, fire timers,
    /// housekeeping. Call only while holding the leader lease.
    pub async fn leader_pass(&self, now: DateTime<Utc>) -> Result<()> {
        // Seed next_due_time for jobs that have none yet.
        for job in self.scheduler.list_enabled_jobs().await? {
            if job.next_due_time.is_none() {
                let expr = CronExpr::parse(&job.cron_schedule)?;
                if let Some(next) = expr.next_after(now) {
                    self.scheduler.update_next_due(job.job_id, next).await?;
                }
            }
        }

        // Materialize at most one run per due instant, then advance.
        let mut materialized = 0u64;
        for job in self.scheduler.due_jobs().await? {
            let Some(due) = job.next_due_time else { continue };
            match self.scheduler.materialize_run(job.job_id, due).await? {
                MaterializeResult::Created(run_id) => {
                    debug!(job = %job.job_name, run_id = %run_id, scheduled = %due, "run materialized");
                    materialized += 1;
                }
                MaterializeResult::AlreadyExists => {}
            }
            // Missed windows collapse: the next instant is relative to now.
            let expr = CronExpr::parse(&job.cron_schedule)?;
            if let Some(next) = expr.next_after(now) {
                self.scheduler.update_next_due(job.job_id, next).await?;
            }
        }
        if materialized > 0 {
            self.metrics
                .record("scheduler.runs_materialized", materialized as f64, now)
                .await;
        }

        // Fire due timers through the outbox.
        let mut fired = 0u64;
        for timer in self.scheduler.due_timers(self.config.timer_batch_size).await? {
            let opts = EnqueueOptions {
                // Deterministic id: re-firing after a crash dedupes.
                message_id: Some(MessageId::from_uuid(timer.timer_id.into_inner())),
                correlation_id: timer.correlation_id,
                due_time: None,
                join_id: None,
            };
            self.outbox
                .enqueue(&timer.topic, timer.payload.clone(), opts)
                .await?;
            self.scheduler.complete_timer(timer.timer_id).await?;
            fired += 1;
        }
        if fired > 0 {
            self.metrics
                .record("scheduler.timers_fired", fired as f64, now)
                .await;
        }

        // Housekeeping rides the leader tick.
        self.outbox
            .sweep_dispatched(now - self.config.retention)
            .await?;

        Ok(())
    }

    /// Execute claimed runs by delegating to the job's topic via the
    /// outbox. Returns the number of runs driven.
    pub async fn run_executor_pass(&self) -> Result<usize> {
        let claimed = self
            .scheduler
            .claim(self.owner, self.config.run_lease, self.config.run_batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let ids: Vec<uuid::Uuid> = claimed.iter().map(|i| i.id).collect();
        let runs = self.scheduler.load_runs(&ids).await?;
        let mut processed = 0;

        for run in runs {
            let Some(job) = self.scheduler.get_job(run.job_id).await? else {
                warn!(run_id = %run.run_id, "run references a deleted job; poisoning");
                self.scheduler
                    .fail(self.owner, &[run.item.id], "job definition missing")
                    .await?;
                continue;
            };

            let opts = EnqueueOptions {
                message_id: Some(MessageId::from_uuid(run.run_id.into_inner())),
                ..Default::default()
            };
            match self
                .outbox
                .enqueue(&job.topic, job.payload.clone(), opts)
                .await
            {
                Ok(_) => {
                    self.scheduler.ack(self.owner, &[run.item.id]).await?;
                    self.scheduler
                        .record_run_outcome(job.job_id, run.scheduled_time, RunStatus::Succeeded)
                        .await?;
                    processed += 1;
                }
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "run delegation failed");
                    self.scheduler
                        .reschedule(
                            self.owner,
                            run.item.id,
                            Duration::from_secs(30),
                            "outbox enqueue failed",
                        )
                        .await?;
                }
            }
        }
        Ok(processed)
    }
}

#[async_trait::async_trait]
impl Service for SchedulerWorker {
    fn name(&self) -> &'static str {
        "scheduler-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut was_leader = false;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let grant = match self
                .leases
                .acquire(SCHEDULER_LEADER_LEASE, &self.worker_id, self.config.leader_lease)
                .await
            {
                Ok(grant) => grant,
                Err(e) => {
                    warn!(error = %e, "leader lease acquire failed");
                    idle_sleep(self.config.tick_interval, &shutdown).await;
                    continue;
                }
            };

            if grant.acquired {
                if !was_leader {
                    info!(worker_id = %self.worker_id, "scheduler leadership acquired");
                    was_leader = true;
                }
                if let Err(e) = self.leader_pass(grant.server_now).await {
                    error!(error = %e, "leader pass failed");
                }
            } else if was_leader {
                info!(worker_id = %self.worker_id, "scheduler leadership lost");
                was_leader = false;
            }

            // Every worker executes runs, leader or not.
            match self.run_executor_pass().await {
                Ok(0) => idle_sleep(self.config.tick_interval, &shutdown).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "run executor pass failed");
                    idle_sleep(self.config.tick_interval, &shutdown).await;
                }
            }
        }

        if was_leader {
            let _ = self
                .leases
                .release(SCHEDULER_LEADER_LEASE, &self.worker_id)
                .await;
        }
        Ok(())
    }
}
