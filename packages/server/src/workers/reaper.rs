//! Reaper: returns expired claims to the visible pool.
//!
//! Runs continuously across every queue table; reaping is idempotent so
//! cadence only affects recovery latency. The cadence must stay strictly
//! below the shortest claim lease in use, otherwise a crashed worker's rows
//! wait a full extra cycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taskmill::metrics::MetricRecorder;
use taskmill::work_item::WorkQueue;

use crate::kernel::service_host::Service;
use crate::workers::idle_sleep;

pub struct Reaper {
    queues: Vec<(&'static str, Arc<dyn WorkQueue>)>,
    cadence: Duration,
    metrics: Arc<dyn MetricRecorder>,
}

impl Reaper {
    /// `cadence` must be strictly less than the shortest lease duration any
    /// worker claims with.
    pub fn new(
        queues: Vec<(&'static str, Arc<dyn WorkQueue>)>,
        cadence: Duration,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        Self {
            queues,
            cadence,
            metrics,
        }
    }

    /// One pass over all queues. Returns total rows reaped.
    pub async fn run_once(&self) -> Result<u64> {
        let mut total = 0;
        for (name, queue) in &self.queues {
            match queue.reap_expired().await {
                Ok(0) => {}
                Ok(reaped) => {
                    info!(queue = name, reaped, "released expired claims");
                    total += reaped;
                }
                Err(e) => warn!(queue = name, error = %e, "reap failed"),
            }
        }
        if total > 0 {
            self.metrics
                .record("work_queue.reaped", total as f64, chrono::Utc::now())
                .await;
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl Service for Reaper {
    fn name(&self) -> &'static str {
        "reaper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let _ = self.run_once().await;
            idle_sleep(self.cadence, &shutdown).await;
        }
        Ok(())
    }
}
