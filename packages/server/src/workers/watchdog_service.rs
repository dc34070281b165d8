//! Watchdog probes and service wrapper.
//!
//! The probes query platform state through the store contracts; the
//! service hosts the engine's watchdog loop (scan + heartbeat cadences)
//! under the process shutdown token.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use taskmill::inbox::InboxStore;
use taskmill::scheduler::SchedulerStore;
use taskmill::watchdog::{Alert, AlertSeverity, Watchdog, WatchdogProbe};

use crate::kernel::service_host::Service;

/// Alerts when enabled jobs have been due longer than the threshold, which
/// means no leader is materializing runs.
pub struct OverdueJobsProbe {
    store: Arc<dyn SchedulerStore>,
    threshold: chrono::Duration,
}

impl OverdueJobsProbe {
    pub fn new(store: Arc<dyn SchedulerStore>, threshold: chrono::Duration) -> Self {
        Self { store, threshold }
    }
}

#[async_trait]
impl WatchdogProbe for OverdueJobsProbe {
    fn name(&self) -> &str {
        "scheduler-overdue"
    }

    async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let overdue: Vec<_> = self
            .store
            .due_jobs()
            .await?
            .into_iter()
            .filter(|j| {
                j.next_due_time
                    .map_or(false, |due| now - due > self.threshold)
            })
            .collect();

        Ok(overdue
            .into_iter()
            .map(|job| Alert {
                source: "scheduler-overdue".into(),
                severity: AlertSeverity::Warning,
                message: format!(
                    "job {:?} overdue since {}",
                    job.job_name,
                    job.next_due_time.map(|d| d.to_rfc3339()).unwrap_or_default()
                ),
                at: now,
                data: None,
            })
            .collect())
    }
}

/// Alerts when inbox rows have sat in a non-terminal state past the stuck
/// threshold.
pub struct StuckInboxProbe {
    store: Arc<dyn InboxStore>,
    threshold: chrono::Duration,
}

impl StuckInboxProbe {
    pub fn new(store: Arc<dyn InboxStore>, threshold: chrono::Duration) -> Self {
        Self { store, threshold }
    }
}

#[async_trait]
impl WatchdogProbe for StuckInboxProbe {
    fn name(&self) -> &str {
        "inbox-stuck"
    }

    async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let stuck = self.store.stuck_count(now - self.threshold).await?;
        if stuck == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Alert {
            source: "inbox-stuck".into(),
            severity: AlertSeverity::Warning,
            message: format!("{stuck} inbox rows stuck past threshold"),
            at: now,
            data: Some(serde_json::json!({ "stuck": stuck })),
        }])
    }
}

/// Hosts the engine watchdog as a service.
pub struct WatchdogService {
    watchdog: Arc<Watchdog>,
}

impl WatchdogService {
    pub fn new(watchdog: Arc<Watchdog>) -> Self {
        Self { watchdog }
    }
}

#[async_trait]
impl Service for WatchdogService {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.watchdog.run(shutdown).await;
        Ok(())
    }
}
