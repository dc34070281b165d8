//! Outbox dispatcher.
//!
//! Claims due outbox messages, invokes the handler registered for each
//! topic, and drives every message to ack, reschedule, or poison. With
//! multiple databases the selection strategy decides which store the next
//! pass polls; the previous pass's processed count feeds drain-first
//! stickiness.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use taskmill::backoff::{BackoffPolicy, RetryPolicy};
use taskmill::error::HandlerOutcome;
use taskmill::handler::{HandlerContext, HandlerRegistry};
use taskmill::id::OwnerToken;
use taskmill::metrics::MetricRecorder;
use taskmill::outbox::{OutboxMessage, OutboxStore};
use taskmill::routing::{SelectionStrategy, StoreKey};
use taskmill::work_item::WorkQueue;

use crate::kernel::service_host::Service;
use crate::workers::idle_sleep;

/// Tuning for the dispatcher loop.
#[derive(Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// Handler deadline is the lease minus this margin, so a slow handler
    /// is cancelled before the reaper can hand its row to someone else.
    pub safety_margin: Duration,
    pub backoff: BackoffPolicy,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(60),
            safety_margin: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct OutboxDispatcher {
    stores: Vec<(StoreKey, Arc<dyn OutboxStore>)>,
    registry: Arc<HandlerRegistry>,
    strategy: std::sync::Mutex<Box<dyn SelectionStrategy>>,
    config: DispatcherConfig,
    owner: OwnerToken,
    metrics: Arc<dyn MetricRecorder>,
    last_processed: std::sync::atomic::AtomicUsize,
}

impl OutboxDispatcher {
    pub fn new(
        stores: Vec<(StoreKey, Arc<dyn OutboxStore>)>,
        registry: Arc<HandlerRegistry>,
        strategy: Box<dyn SelectionStrategy>,
        config: DispatcherConfig,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        Self {
            stores,
            registry,
            strategy: std::sync::Mutex::new(strategy),
            config,
            owner: OwnerToken::new(),
            metrics,
            last_processed: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Single-database convenience constructor.
    pub fn single(
        store: Arc<dyn OutboxStore>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        let key = StoreKey::from("primary");
        Self::new(
            vec![(key.clone(), store)],
            registry,
            Box::new(taskmill::routing::RoundRobin::new(vec![key])),
            config,
            metrics,
        )
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    fn next_store(&self) -> Option<Arc<dyn OutboxStore>> {
        let previous = self
            .last_processed
            .load(std::sync::atomic::Ordering::SeqCst);
        let key = self.strategy.lock().unwrap().select_next(previous)?;
        self.stores
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, s)| Arc::clone(s))
    }

    /// One claim-process pass against the next selected store. Returns the
    /// number of messages driven to any terminal-or-rescheduled state.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<usize> {
        let Some(store) = self.next_store() else {
            return Ok(0);
        };

        let claimed = store
            .claim(self.owner, self.config.lease_duration, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            self.last_processed
                .store(0, std::sync::atomic::Ordering::SeqCst);
            return Ok(0);
        }
        debug!(count = claimed.len(), "claimed outbox messages");
        self.metrics
            .record(
                "outbox.claimed",
                claimed.len() as f64,
                chrono::Utc::now(),
            )
            .await;

        let ids: Vec<uuid::Uuid> = claimed.iter().map(|i| i.id).collect();
        let messages = store.load(&ids).await?;

        let mut processed = 0;
        for message in messages {
            if shutdown.is_cancelled() {
                // Stop claiming-adjacent work; unprocessed rows will be
                // reaped after the lease runs out.
                break;
            }
            self.dispatch_one(store.as_ref(), message, shutdown).await;
            processed += 1;
        }

        self.last_processed
            .store(processed, std::sync::atomic::Ordering::SeqCst);
        Ok(processed)
    }

    async fn dispatch_one(
        &self,
        store: &dyn OutboxStore,
        message: OutboxMessage,
        shutdown: &CancellationToken,
    ) {
        let id = message.item.id;
        let topic = message.topic.clone();

        let handlers = self.registry.handlers_for(&topic);
        if handlers.is_empty() {
            error!(message_id = %message.message_id, topic = %topic, "no handler registered");
            if let Err(e) = store.fail(self.owner, &[id], "no handler registered").await {
                error!(error = %e, "failed to poison unroutable message");
            }
            return;
        }

        let ctx = HandlerContext::new(shutdown.child_token(), message.item.retry_count as u32);
        let deadline = self
            .config
            .lease_duration
            .saturating_sub(self.config.safety_margin);

        let mut outcome = HandlerOutcome::Success;
        for handler in handlers {
            let result =
                tokio::time::timeout(deadline, handler.handle(&message.payload, &ctx)).await;
            outcome = match result {
                Ok(Ok(o)) => o,
                Ok(Err(e)) => {
                    warn!(message_id = %message.message_id, topic = %topic, error = %e, "handler error");
                    HandlerOutcome::Transient(None)
                }
                Err(_) => {
                    warn!(message_id = %message.message_id, topic = %topic, "handler deadline exceeded");
                    HandlerOutcome::Transient(None)
                }
            };
            if !outcome.is_success() {
                break;
            }
        }

        match outcome {
            HandlerOutcome::Success => {
                if let Err(e) = store.ack(self.owner, &[id]).await {
                    error!(message_id = %message.message_id, error = %e, "ack failed");
                    return;
                }
                self.metrics
                    .record("outbox.dispatched", 1.0, chrono::Utc::now())
                    .await;
            }
            HandlerOutcome::Transient(delay) => {
                let retry_count = message.item.retry_count as u32;
                if self.config.retry.is_exhausted(retry_count) {
                    warn!(
                        message_id = %message.message_id,
                        attempts = retry_count + 1,
                        "max attempts exhausted, poisoning"
                    );
                    if let Err(e) = store
                        .fail(self.owner, &[id], "max attempts exhausted")
                        .await
                    {
                        error!(message_id = %message.message_id, error = %e, "fail failed");
                    }
                    self.metrics
                        .record("outbox.poisoned", 1.0, chrono::Utc::now())
                        .await;
                } else {
                    let delay = delay.unwrap_or_else(|| self.config.backoff.delay_for(retry_count));
                    if let Err(e) = store
                        .reschedule(self.owner, id, delay, "transient handler failure")
                        .await
                    {
                        error!(message_id = %message.message_id, error = %e, "reschedule failed");
                    }
                }
            }
            HandlerOutcome::Permanent(reason) => {
                error!(message_id = %message.message_id, topic = %topic, reason = %reason, "permanent failure");
                if let Err(e) = store.fail(self.owner, &[id], &reason).await {
                    error!(message_id = %message.message_id, error = %e, "fail failed");
                }
                self.metrics
                    .record("outbox.poisoned", 1.0, chrono::Utc::now())
                    .await;
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for OutboxDispatcher {
    fn name(&self) -> &'static str {
        "outbox-dispatcher"
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
                    warn!(error = %e, "dispatcher pass failed");
                    idle_sleep(self.config.poll_interval, &shutdown).await;
                }
            }
        }
        Ok(())
    }
}
