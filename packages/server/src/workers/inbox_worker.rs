//! Inbox background worker.
//!
//! Claims pending inbox rows, selects handlers by event type, and executes
//! them under the exactly-once executor keyed by the row's dedupe key. The
//! executor guarantees at most one successful domain effect per key no
//! matter how often a row is re-claimed or a provider re-delivers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use taskmill::backoff::{BackoffPolicy, RetryPolicy};
use taskmill::error::HandlerOutcome;
use taskmill::exactly_once::{ExactlyOnceExecutor, ExecutionVerdict, OperationResult};
use taskmill::handler::{HandlerContext, HandlerRegistry};
use taskmill::id::OwnerToken;
use taskmill::inbox::{InboxRecord, InboxStore};
use taskmill::metrics::MetricRecorder;
use taskmill::work_item::WorkQueue;

use crate::kernel::service_host::Service;
use crate::workers::idle_sleep;

#[derive(Clone)]
pub struct InboxWorkerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub backoff: BackoffPolicy,
    pub retry: RetryPolicy,
}

impl Default for InboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct InboxWorker {
    store: Arc<dyn InboxStore>,
    registry: Arc<HandlerRegistry>,
    executor: Arc<ExactlyOnceExecutor>,
    config: InboxWorkerConfig,
    owner: OwnerToken,
    metrics: Arc<dyn MetricRecorder>,
}

impl InboxWorker {
    pub fn new(
        store: Arc<dyn InboxStore>,
        registry: Arc<HandlerRegistry>,
        executor: Arc<ExactlyOnceExecutor>,
        config: InboxWorkerConfig,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            config,
            owner: OwnerToken::new(),
            metrics,
        }
    }

    /// One claim-process pass. Returns processed row count.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<usize> {
        let claimed = self
            .store
            .claim(self.owner, self.config.lease_duration, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let ids: Vec<uuid::Uuid> = claimed.iter().map(|i| i.id).collect();
        let records = self.store.load(&ids).await?;
        debug!(count = records.len(), "claimed inbox rows");

        let mut processed = 0;
        for record in records {
            if shutdown.is_cancelled() {
                break;
            }
            self.process_one(record, shutdown).await;
            processed += 1;
        }
        self.metrics
            .record("inbox.processed", processed as f64, chrono::Utc::now())
            .await;
        Ok(processed)
    }

    async fn process_one(&self, record: InboxRecord, shutdown: &CancellationToken) {
        let id = record.item.id;
        let key = format!("{}:{}", record.source, record.message_id);
        let handlers = self.registry.handlers_for(&record.event_type);

        if handlers.is_empty() {
            // No subscriber for this event type; completing keeps the row
            // from cycling forever.
            debug!(key = %key, event_type = %record.event_type, "no handlers; completing");
            if let Err(e) = self.store.ack(self.owner, &[id]).await {
                error!(key = %key, error = %e, "ack failed");
            }
            return;
        }

        let ctx = HandlerContext::new(shutdown.child_token(), record.item.retry_count as u32);
        let payload = record.payload.clone();

        let verdict = self
            .executor
            .execute(&key, || async {
                for handler in &handlers {
                    match handler.handle(&payload, &ctx).await {
                        Ok(HandlerOutcome::Success) => {}
                        Ok(HandlerOutcome::Transient(_)) => {
                            return OperationResult::Transient(anyhow::anyhow!(
                                "handler reported transient failure"
                            ))
                        }
                        Ok(HandlerOutcome::Permanent(reason)) => {
                            return OperationResult::Permanent(reason)
                        }
                        Err(e) => return OperationResult::Transient(e),
                    }
                }
                OperationResult::Success
            })
            .await;

        match verdict {
            Ok(ExecutionVerdict::Completed) | Ok(ExecutionVerdict::Suppressed) => {
                if let Err(e) = self.store.ack(self.owner, &[id]).await {
                    error!(key = %key, error = %e, "ack failed");
                }
            }
            Ok(ExecutionVerdict::FailedPermanent) => {
                error!(key = %key, event_type = %record.event_type, "permanent handler failure");
                if let Err(e) = self
                    .store
                    .fail(self.owner, &[id], "permanent handler failure")
                    .await
                {
                    error!(key = %key, error = %e, "fail failed");
                }
            }
            Ok(ExecutionVerdict::Retry) => {
                let retry_count = record.item.retry_count as u32;
                if self.config.retry.is_exhausted(retry_count) {
                    warn!(key = %key, attempts = retry_count + 1, "max attempts exhausted, poisoning");
                    if let Err(e) = self
                        .store
                        .fail(self.owner, &[id], "max attempts exhausted")
                        .await
                    {
                        error!(key = %key, error = %e, "fail failed");
                    }
                } else {
                    let delay = self.config.backoff.delay_for(retry_count);
                    if let Err(e) = self
                        .store
                        .reschedule(self.owner, id, delay, "transient handler failure")
                        .await
                    {
                        error!(key = %key, error = %e, "reschedule failed");
                    }
                }
            }
            Err(e) => {
                // Idempotency store unavailable: leave the row claimed, the
                // reaper returns it after the lease expires.
                warn!(key = %key, error = %e, "exactly-once executor unavailable");
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for InboxWorker {
    fn name(&self) -> &'static str {
        "inbox-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once(&shutdown).await {
                Ok(0) => idle_sleep(self.config.poll_interval, &shutdown).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "inbox pass failed");
                    idle_sleep(self.config.poll_interval, &shutdown).await;
                }
            }
        }
        Ok(())
    }
}
