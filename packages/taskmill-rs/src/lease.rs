//! Distributed leases and fencing tokens.
//!
//! Two layers:
//!
//! - **Coarse named leases** for leader election of singleton workers
//!   (`scheduler-leader`, one lease per fanout topic).
//! - **Fine-grained locks** with fencing: every successful acquire/renew
//!   re-issues a monotonically non-decreasing 64-bit token per resource.
//!   Downstream stores must reject writes carrying a token lower than the
//!   highest they have seen for that resource.
//!
//! [`LeaseHandle`] is the client-side object: it renews on a timer at
//! `duration * renew_percent` plus jitter (to de-synchronize peers), exposes
//! a lost-signal as a `CancellationToken`, and releases best-effort on drop.
//! A renew that fails marks the lease lost permanently for that handle; no
//! further tokens are emitted locally.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskmillError;
use crate::id::OwnerToken;

// =============================================================================
// Tokens and store contracts
// =============================================================================

/// Monotonically non-decreasing counter bound to a resource. Never reused,
/// never decreased.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct FencingToken(pub i64);

impl FencingToken {
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a coarse-lease acquire attempt. Timestamps are the store's
/// clock so callers never mix in their own.
#[derive(Debug, Clone)]
pub struct CoarseLeaseGrant {
    pub acquired: bool,
    pub server_now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

/// Coarse named leases (`Lease` table).
#[async_trait]
pub trait CoarseLeaseStore: Send + Sync {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        duration: Duration,
    ) -> anyhow::Result<CoarseLeaseGrant>;

    /// Extend the lease iff `owner` still holds it.
    async fn renew(&self, name: &str, owner: &str, duration: Duration) -> anyhow::Result<bool>;

    /// Best-effort; releasing a lease held by someone else is a no-op.
    async fn release(&self, name: &str, owner: &str) -> anyhow::Result<()>;
}

/// Fine-grained locks with fencing (`DistributedLock` table).
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Try to take the lock. `Some(token)` on success; the token is strictly
    /// greater than any token previously issued for the resource.
    async fn acquire(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
        context: Option<serde_json::Value>,
    ) -> anyhow::Result<Option<FencingToken>>;

    /// Extend the lock iff `owner` still holds it, re-issuing the token.
    async fn renew(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
    ) -> anyhow::Result<Option<FencingToken>>;

    /// Best-effort release.
    async fn release(&self, resource: &str, owner: OwnerToken) -> anyhow::Result<()>;
}

/// Acquire with an optional gate: poll until the lock is granted or the gate
/// times out. A `gate` of `None` is a single attempt.
pub async fn acquire_with_gate(
    store: &dyn LockStore,
    resource: &str,
    owner: OwnerToken,
    duration: Duration,
    context: Option<serde_json::Value>,
    gate: Option<Duration>,
) -> anyhow::Result<Option<FencingToken>> {
    let deadline = gate.map(|g| tokio::time::Instant::now() + g);
    loop {
        if let Some(token) = store
            .acquire(resource, owner, duration, context.clone())
            .await?
        {
            return Ok(Some(token));
        }
        match deadline {
            Some(deadline) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50 + fastrand::u64(0..50))).await;
            }
            _ => return Ok(None),
        }
    }
}

// =============================================================================
// Client-side lease handle
// =============================================================================

/// Tuning for [`LeaseHandle`] renewal.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub duration: Duration,
    /// Fraction of the duration after which renewal fires.
    pub renew_percent: f64,
    /// Uniform jitter added to each renew delay, de-synchronizing peers.
    pub renew_jitter: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            renew_percent: 0.5,
            renew_jitter: Duration::from_millis(500),
        }
    }
}

impl LeaseConfig {
    fn renew_delay(&self) -> Duration {
        let base = self.duration.mul_f64(self.renew_percent.clamp(0.05, 0.95));
        let jitter_ms = self.renew_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(fastrand::u64(0..=jitter_ms))
        }
    }
}

struct LeaseShared {
    resource: String,
    owner: OwnerToken,
    token: AtomicI64,
    lost: AtomicBool,
    lost_signal: CancellationToken,
    store: Arc<dyn LockStore>,
    config: LeaseConfig,
    /// Serializes renewal between the timer task and `try_renew_now`.
    renew_gate: tokio::sync::Mutex<()>,
}

impl LeaseShared {
    fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            warn!(resource = %self.resource, owner = %self.owner, "lease lost");
            self.lost_signal.cancel();
        }
    }

    async fn renew_once(&self) -> bool {
        let _serialized = self.renew_gate.lock().await;
        if self.lost.load(Ordering::SeqCst) {
            return false;
        }
        match self
            .store
            .renew(&self.resource, self.owner, self.config.duration)
            .await
        {
            Ok(Some(token)) => {
                // Tokens only move forward; a renew can re-issue the same
                // value but never a smaller one.
                self.token.fetch_max(token.value(), Ordering::SeqCst);
                debug!(resource = %self.resource, token = token.value(), "lease renewed");
                true
            }
            Ok(None) => {
                self.mark_lost();
                false
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "lease renew failed");
                self.mark_lost();
                false
            }
        }
    }
}

/// A held fine-grained lock with background renewal.
///
/// Dropping the handle stops renewal, fires the lost-signal, and releases
/// the lock best-effort.
pub struct LeaseHandle {
    shared: Arc<LeaseShared>,
    renew_task: Option<JoinHandle<()>>,
}

impl LeaseHandle {
    /// Acquire `resource` and start the renewal timer. `Ok(None)` when the
    /// lock is currently held by someone else.
    pub async fn acquire(
        store: Arc<dyn LockStore>,
        resource: impl Into<String>,
        config: LeaseConfig,
    ) -> anyhow::Result<Option<LeaseHandle>> {
        let resource = resource.into();
        let owner = OwnerToken::new();
        let Some(token) = store.acquire(&resource, owner, config.duration, None).await? else {
            return Ok(None);
        };

        let shared = Arc::new(LeaseShared {
            resource,
            owner,
            token: AtomicI64::new(token.value()),
            lost: AtomicBool::new(false),
            lost_signal: CancellationToken::new(),
            store,
            config,
            renew_gate: tokio::sync::Mutex::new(()),
        });

        let renew_shared = Arc::clone(&shared);
        let renew_task = tokio::spawn(async move {
            loop {
                let delay = renew_shared.config.renew_delay();
                tokio::select! {
                    _ = renew_shared.lost_signal.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        if !renew_shared.renew_once().await {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Some(LeaseHandle {
            shared,
            renew_task: Some(renew_task),
        }))
    }

    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    pub fn owner(&self) -> OwnerToken {
        self.shared.owner
    }

    /// The highest fencing token issued to this handle. Transmit it with
    /// every downstream side-effect write.
    pub fn fencing_token(&self) -> FencingToken {
        FencingToken(self.shared.token.load(Ordering::SeqCst))
    }

    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::SeqCst)
    }

    /// Child token that fires when the lease is lost (renew failure,
    /// revocation, or drop). Link worker cancellation to this.
    pub fn lost_signal(&self) -> CancellationToken {
        self.shared.lost_signal.child_token()
    }

    /// Error when ownership can no longer be proven.
    pub fn ensure_held(&self) -> Result<(), TaskmillError> {
        if self.is_lost() {
            Err(TaskmillError::LeaseLost {
                resource: self.shared.resource.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Renew immediately, off-schedule. Returns false when the lease is
    /// (now) lost.
    pub async fn try_renew_now(&self) -> bool {
        self.shared.renew_once().await
    }

    /// Stop renewing and release the lock. Preferred over drop when the
    /// caller can await.
    pub async fn release(mut self) {
        self.stop_renewal();
        self.shared.lost_signal.cancel();
        let shared = Arc::clone(&self.shared);
        if let Err(e) = shared.store.release(&shared.resource, shared.owner).await {
            debug!(resource = %shared.resource, error = %e, "lease release failed");
        }
    }

    fn stop_renewal(&mut self) {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.stop_renewal();
        self.shared.lost_signal.cancel();
        // Best-effort release; silently skipped outside a runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                let _ = shared.store.release(&shared.resource, shared.owner).await;
            });
        }
    }
}

/// Tracks the highest fencing token seen per resource and rejects stale
/// writers, the check every downstream side-effect store performs.
#[derive(Default)]
pub struct FencingGuard {
    highest: dashmap::DashMap<String, i64>,
}

impl FencingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `token` for `resource`, recording it as the new high-water mark
    /// when it is not below the current one.
    pub fn admit(&self, resource: &str, token: FencingToken) -> Result<(), TaskmillError> {
        let mut entry = self.highest.entry(resource.to_string()).or_insert(i64::MIN);
        if token.value() < *entry {
            return Err(TaskmillError::LeaseLost {
                resource: resource.to_string(),
            });
        }
        *entry = token.value();
        Ok(())
    }

    pub fn highest_seen(&self, resource: &str) -> Option<FencingToken> {
        self.highest.get(resource).map(|v| FencingToken(*v))
    }
}
