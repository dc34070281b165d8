//! Fanout worker: per-shard slice emission under per-topic leases.
//!
//! Each tick walks every policy this worker can take the lease for,
//! computes elapsed windows per shard cursor, and enqueues one slice
//! message per window. The cursor advances by compare-and-set after each
//! emission, so a racing tick loses the CAS instead of double-advancing;
//! the duplicate slice it may have enqueued is the at-least-once contract
//! downstream consumers already handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskmill::clock::SharedClock;
use taskmill::fanout::{elapsed_windows, slice_for, FanoutPolicy, FanoutStore};
use taskmill::id::CorrelationId;
use taskmill::lease::{LeaseConfig, LeaseHandle, LockStore};
use taskmill::metrics::MetricRecorder;
use taskmill::outbox::{EnqueueOptions, OutboxStore};

use crate::kernel::service_host::Service;
use crate::workers::idle_sleep;

pub struct FanoutWorker {
    fanout: Arc<dyn FanoutStore>,
    outbox: Arc<dyn OutboxStore>,
    locks: Arc<dyn LockStore>,
    clock: SharedClock,
    metrics: Arc<dyn MetricRecorder>,
    poll_interval: Duration,
}

impl FanoutWorker {
    pub fn new(
        fanout: Arc<dyn FanoutStore>,
        outbox: Arc<dyn OutboxStore>,
        locks: Arc<dyn LockStore>,
        clock: SharedClock,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        Self {
            fanout,
            outbox,
            locks,
            clock,
            metrics,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Tick one policy: emit elapsed windows for every shard. Returns the
    /// number of slices enqueued. The caller must hold the topic lease.
    pub async fn tick_policy(&self, policy: &FanoutPolicy) -> Result<u64> {
        let interval = policy.interval();
        let now = self.clock.now();
        let mut emitted = 0u64;

        for shard in self.fanout.shards(&policy.fanout_topic).await? {
            let cursor = self.fanout.cursor(&policy.fanout_topic, &shard).await?;
            let windows =
                elapsed_windows(&cursor, interval, now, policy.max_catchup_windows);

            let mut previous = cursor.last_emitted_window_start;
            for window_start in windows {
                let slice = slice_for(policy, &shard, window_start, CorrelationId::new());
                self.outbox
                    .enqueue(
                        &policy.slice_topic(),
                        serde_json::to_value(&slice)?,
                        EnqueueOptions::default(),
                    )
                    .await?;

                let advanced = self
                    .fanout
                    .advance_cursor(&policy.fanout_topic, &shard, previous, window_start)
                    .await?;
                if !advanced {
                    // Someone else advanced this shard; stop emitting for it.
                    debug!(topic = %policy.fanout_topic, shard = %shard, "cursor race lost");
                    break;
                }
                previous = Some(window_start);
                emitted += 1;
            }
        }

        if emitted > 0 {
            self.metrics
                .record("fanout.slices_emitted", emitted as f64, now)
                .await;
        }
        Ok(emitted)
    }

    /// One pass over all policies, taking the per-topic lease for each.
    pub async fn run_once(&self) -> Result<u64> {
        let mut total = 0;
        for policy in self.fanout.list_policies().await? {
            let lease_config = LeaseConfig {
                duration: Duration::from_secs(policy.lease_seconds.max(1) as u64),
                ..Default::default()
            };
            let resource = format!("fanout:{}", policy.fanout_topic);
            let Some(lease) =
                LeaseHandle::acquire(Arc::clone(&self.locks), resource, lease_config).await?
            else {
                continue; // another worker owns this topic
            };

            match self.tick_policy(&policy).await {
                Ok(emitted) => total += emitted,
                Err(e) => warn!(topic = %policy.fanout_topic, error = %e, "fanout tick failed"),
            }
            lease.release().await;
        }
        Ok(total)
    }
}

#[async_trait::async_trait]
impl Service for FanoutWorker {
    fn name(&self) -> &'static str {
        "fanout-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "fanout pass failed");
            }
            idle_sleep(self.poll_interval, &shutdown).await;
        }
        Ok(())
    }
}
