//! Watchdog: periodic state scans and heartbeats.
//!
//! The watchdog loop runs two cadences. On each scan it queries every
//! registered probe (overdue scheduler jobs, inbox rows stuck past a
//! threshold) and fans resulting alerts out to all sinks. On each heartbeat
//! it emits a heartbeat event carrying a monotonically increasing sequence
//! number, so a silent watchdog is itself detectable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::SharedClock;

/// Severity of a watchdog alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One finding from a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub source: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Heartbeat event emitted on the heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

/// Queries one slice of platform state for problems.
#[async_trait]
pub trait WatchdogProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Alert>>;
}

/// Receives alerts and heartbeats.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: &Alert) -> anyhow::Result<()>;

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> anyhow::Result<()>;
}

/// Sink that writes alerts to the log. The default sink in development.
#[derive(Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            AlertSeverity::Critical => {
                tracing::error!(source = %alert.source, message = %alert.message, "watchdog alert")
            }
            AlertSeverity::Warning => {
                tracing::warn!(source = %alert.source, message = %alert.message, "watchdog alert")
            }
            AlertSeverity::Info => {
                tracing::info!(source = %alert.source, message = %alert.message, "watchdog alert")
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> anyhow::Result<()> {
        debug!(sequence = heartbeat.sequence, "watchdog heartbeat");
        Ok(())
    }
}

/// Cadence configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub scan_period: Duration,
    pub heartbeat_period: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            scan_period: Duration::from_secs(60),
            heartbeat_period: Duration::from_secs(15),
        }
    }
}

/// The watchdog loop.
pub struct Watchdog {
    probes: Vec<Arc<dyn WatchdogProbe>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    config: WatchdogConfig,
    clock: SharedClock,
    sequence: std::sync::atomic::AtomicU64,
}

impl Watchdog {
    pub fn new(
        probes: Vec<Arc<dyn WatchdogProbe>>,
        sinks: Vec<Arc<dyn AlertSink>>,
        config: WatchdogConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            probes,
            sinks,
            config,
            clock,
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Run one scan pass: query every probe concurrently, fan alerts out to
    /// every sink. Probe and sink errors are logged and do not stop the
    /// pass.
    pub async fn scan_once(&self) -> Vec<Alert> {
        let now = self.clock.now();
        let results =
            futures::future::join_all(self.probes.iter().map(|probe| probe.scan(now))).await;
        let mut all = Vec::new();
        for (probe, result) in self.probes.iter().zip(results) {
            match result {
                Ok(alerts) => all.extend(alerts),
                Err(e) => warn!(probe = probe.name(), error = %e, "watchdog probe failed"),
            }
        }
        for alert in &all {
            for sink in &self.sinks {
                if let Err(e) = sink.alert(alert).await {
                    warn!(error = %e, "alert sink failed");
                }
            }
        }
        all
    }

    /// Emit one heartbeat with the next sequence number.
    pub async fn heartbeat_once(&self) -> Heartbeat {
        let heartbeat = Heartbeat {
            sequence: self
                .sequence
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
            at: self.clock.now(),
        };
        for sink in &self.sinks {
            if let Err(e) = sink.heartbeat(&heartbeat).await {
                warn!(error = %e, "heartbeat sink failed");
            }
        }
        heartbeat
    }

    /// Run until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut scan = tokio::time::interval(self.config.scan_period);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_period);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = scan.tick() => {
                    self.scan_once().await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat_once().await;
                }
            }
        }
    }
}
