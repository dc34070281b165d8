//! Exactly-once execution over an at-least-once transport.
//!
//! The executor runs a caller-supplied operation under an idempotency key
//! and turns the operation's result into a terminal verdict. The store
//! gates entry: `try_begin` succeeds when the key is absent or previously
//! `Failed`, and refuses when it is `InProgress` or `Completed`, so replays
//! and concurrent deliveries of the same key collapse to at most one
//! successful domain effect.
//!
//! An optional probe can verify whether the external side effect already
//! happened, used when the primary call timed out but may have succeeded.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;

/// State of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    InProgress,
    Completed,
    Failed,
}

/// Persistent key → state mapping.
///
/// Keys are domain-chosen (message id, dedupe key). Completed entries may be
/// garbage-collected after a retention period.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Transition the key to `InProgress`. Returns false when the key is
    /// already `InProgress` or `Completed`; a `Failed` key is re-opened.
    async fn try_begin(&self, key: &str) -> anyhow::Result<bool>;

    async fn complete(&self, key: &str) -> anyhow::Result<()>;

    async fn fail(&self, key: &str) -> anyhow::Result<()>;

    async fn state(&self, key: &str) -> anyhow::Result<Option<IdempotencyState>>;

    /// Remove completed entries created before `older_than`. Returns the
    /// number removed.
    async fn sweep(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// What the wrapped operation reported.
#[derive(Debug)]
pub enum OperationResult {
    Success,
    /// The operation may have taken effect (timeout mid-call); retryable.
    Transient(anyhow::Error),
    /// The operation can never succeed.
    Permanent(String),
}

/// Terminal verdict of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionVerdict {
    /// The effect happened during this attempt, or a probe confirmed it
    /// already had.
    Completed,
    /// Another execution owns or already finished this key; nothing ran.
    Suppressed,
    /// The operation reported permanence; the key is closed.
    FailedPermanent,
    /// Transient failure with no confirmation; the key re-opened for retry.
    Retry,
}

/// Verifies whether the external side effect for a key already happened.
#[async_trait]
pub trait SideEffectProbe: Send + Sync {
    async fn confirmed(&self, key: &str) -> anyhow::Result<bool>;
}

/// Runs operations under idempotency keys.
pub struct ExactlyOnceExecutor {
    store: Arc<dyn IdempotencyStore>,
    probe: Option<Arc<dyn SideEffectProbe>>,
}

impl ExactlyOnceExecutor {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store, probe: None }
    }

    pub fn with_probe(mut self, probe: Arc<dyn SideEffectProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    async fn probe_confirms(&self, key: &str) -> bool {
        match &self.probe {
            Some(probe) => probe.confirmed(key).await.unwrap_or(false),
            None => false,
        }
    }

    /// Execute `op` under `key`.
    ///
    /// When entry is refused, a probe (if any) decides between `Completed`
    /// (the effect is verifiably there) and `Suppressed`. When the operation
    /// reports a transient failure, a confirming probe upgrades the attempt
    /// to `Completed` instead of re-opening the key.
    pub async fn execute<F, Fut>(&self, key: &str, op: F) -> anyhow::Result<ExecutionVerdict>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationResult>,
    {
        if !self.store.try_begin(key).await? {
            if self.probe_confirms(key).await {
                debug!(key, "entry refused; probe confirmed prior effect");
                return Ok(ExecutionVerdict::Completed);
            }
            debug!(key, "entry refused; suppressing duplicate execution");
            return Ok(ExecutionVerdict::Suppressed);
        }

        match op().await {
            OperationResult::Success => {
                self.store.complete(key).await?;
                Ok(ExecutionVerdict::Completed)
            }
            OperationResult::Permanent(reason) => {
                debug!(key, reason = %reason, "operation reported permanent failure");
                self.store.complete(key).await?;
                Ok(ExecutionVerdict::FailedPermanent)
            }
            OperationResult::Transient(err) => {
                if self.probe_confirms(key).await {
                    debug!(key, error = %err, "transient failure but probe confirmed effect");
                    self.store.complete(key).await?;
                    Ok(ExecutionVerdict::Completed)
                } else {
                    self.store.fail(key).await?;
                    Ok(ExecutionVerdict::Retry)
                }
            }
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

struct MemoryEntry {
    state: IdempotencyState,
    created_at: DateTime<Utc>,
}

/// Process-local idempotency store. Suitable for tests and for single-node
/// deployments where the work-queue table itself provides cross-process
/// dedupe.
pub struct InMemoryIdempotencyStore {
    entries: DashMap<String, MemoryEntry>,
    clock: SharedClock,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_begin(&self, key: &str) -> anyhow::Result<bool> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state == IdempotencyState::Failed {
                    occupied.get_mut().state = IdempotencyState::InProgress;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    state: IdempotencyState::InProgress,
                    created_at: self.clock.now(),
                });
                Ok(true)
            }
        }
    }

    async fn complete(&self, key: &str) -> anyhow::Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.state = IdempotencyState::Completed;
        }
        Ok(())
    }

    async fn fail(&self, key: &str) -> anyhow::Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.state = IdempotencyState::Failed;
        }
        Ok(())
    }

    async fn state(&self, key: &str) -> anyhow::Result<Option<IdempotencyState>> {
        Ok(self.entries.get(key).map(|e| e.state))
    }

    async fn sweep(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.state == IdempotencyState::Completed && e.created_at < older_than));
        Ok((before - self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, Clock, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> Arc<InMemoryIdempotencyStore> {
        Arc::new(InMemoryIdempotencyStore::new(system_clock()))
    }

    #[tokio::test]
    async fn success_completes_and_replay_is_suppressed() {
        let executor = ExactlyOnceExecutor::new(store());
        let effects = Arc::new(AtomicUsize::new(0));

        for expected in [ExecutionVerdict::Completed, ExecutionVerdict::Suppressed] {
            let effects = effects.clone();
            let verdict = executor
                .execute("msg-1", || async move {
                    effects.fetch_add(1, Ordering::SeqCst);
                    OperationResult::Success
                })
                .await
                .unwrap();
            assert_eq!(verdict, expected);
        }
        assert_eq!(effects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_reopens_key_for_retry() {
        let executor = ExactlyOnceExecutor::new(store());

        let verdict = executor
            .execute("msg-2", || async {
                OperationResult::Transient(anyhow::anyhow!("connection reset"))
            })
            .await
            .unwrap();
        assert_eq!(verdict, ExecutionVerdict::Retry);

        // The retry gets in and can succeed.
        let verdict = executor
            .execute("msg-2", || async { OperationResult::Success })
            .await
            .unwrap();
        assert_eq!(verdict, ExecutionVerdict::Completed);
    }

    #[tokio::test]
    async fn permanent_failure_closes_key() {
        let executor = ExactlyOnceExecutor::new(store());
        let verdict = executor
            .execute("msg-3", || async {
                OperationResult::Permanent("account closed".into())
            })
            .await
            .unwrap();
        assert_eq!(verdict, ExecutionVerdict::FailedPermanent);

        let verdict = executor
            .execute("msg-3", || async { OperationResult::Success })
            .await
            .unwrap();
        assert_eq!(verdict, ExecutionVerdict::Suppressed);
    }

    struct AlwaysConfirmed;

    #[async_trait]
    impl SideEffectProbe for AlwaysConfirmed {
        async fn confirmed(&self, _key: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn probe_upgrades_timeout_to_completed() {
        let executor = ExactlyOnceExecutor::new(store()).with_probe(Arc::new(AlwaysConfirmed));
        let verdict = executor
            .execute("msg-4", || async {
                OperationResult::Transient(anyhow::anyhow!("timeout, maybe delivered"))
            })
            .await
            .unwrap();
        assert_eq!(verdict, ExecutionVerdict::Completed);
    }

    #[tokio::test]
    async fn probe_turns_suppressed_into_completed_on_replay() {
        let executor = ExactlyOnceExecutor::new(store()).with_probe(Arc::new(AlwaysConfirmed));
        executor
            .execute("msg-5", || async { OperationResult::Success })
            .await
            .unwrap();
        let verdict = executor
            .execute("msg-5", || async { OperationResult::Success })
            .await
            .unwrap();
        assert_eq!(verdict, ExecutionVerdict::Completed);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_completed_entries() {
        let clock = ManualClock::start_now();
        let store = Arc::new(InMemoryIdempotencyStore::new(Arc::new(clock.clone())));

        store.try_begin("done-old").await.unwrap();
        store.complete("done-old").await.unwrap();
        store.try_begin("failed-old").await.unwrap();
        store.fail("failed-old").await.unwrap();

        clock.advance(chrono::Duration::days(8));
        store.try_begin("done-new").await.unwrap();
        store.complete("done-new").await.unwrap();

        let cutoff = clock.now() - chrono::Duration::days(7);
        let removed = store.sweep(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.state("done-old").await.unwrap(), None);
        assert!(store.state("failed-old").await.unwrap().is_some());
        assert!(store.state("done-new").await.unwrap().is_some());
    }
}
