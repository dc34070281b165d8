//! Shared work-queue primitives.
//!
//! One row shape and one set of claim/ack/abandon/fail/reap operations,
//! reused by the outbox, the inbox, timers, and job runs. Stores implement
//! [`WorkQueue`]; each operation is a single atomic statement on the SQL side
//! (`UPDATE ... RETURNING` with `FOR UPDATE SKIP LOCKED` for claims) so
//! concurrent claimants never receive the same row.
//!
//! # Ownership
//!
//! A claimed row records the claimant's [`OwnerToken`] and a `locked_until`
//! deadline. Every mutation presents the token; mutations from a stale owner
//! (lease expired, row re-claimed) are silent no-ops. The database clock is
//! the only clock consulted for eligibility.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::OwnerToken;

/// Lifecycle of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Visible for claim once due.
    Pending,
    /// Owned by a worker until `locked_until`.
    Claimed,
    /// Terminal success.
    Completed,
    /// Failed but retryable; visible again once due.
    FailedRetryable,
    /// Terminal failure.
    Poisoned,
}

impl WorkItemStatus {
    /// Statuses that participate in the claim-visibility predicate.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Pending | WorkItemStatus::FailedRetryable
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Completed | WorkItemStatus::Poisoned)
    }
}

/// The generic row shape shared by all work-queue tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub status: WorkItemStatus,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub due_time_utc: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn new(id: Uuid, due: DateTime<Utc>, created: DateTime<Utc>) -> Self {
        Self {
            id,
            status: WorkItemStatus::Pending,
            locked_until: None,
            owner_token: None,
            retry_count: 0,
            last_error: None,
            due_time_utc: due,
            created_at: created,
            processed_at: None,
        }
    }

    /// The claim-visibility invariant, evaluated against a supplied "now".
    ///
    /// A row is visible iff its status is claimable, it is due, and any
    /// previous lock has expired.
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable()
            && self.due_time_utc <= now
            && self.locked_until.map_or(true, |until| until <= now)
    }

    /// Eligible for the reaper: claimed but the lease has run out.
    pub fn is_reapable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkItemStatus::Claimed
            && self.locked_until.map_or(false, |until| until < now)
    }

    /// True when `owner` still holds this row's claim at `now`.
    pub fn is_owned_by(&self, owner: OwnerToken, now: DateTime<Utc>) -> bool {
        self.status == WorkItemStatus::Claimed
            && self.owner_token == Some(owner)
            && self.locked_until.map_or(false, |until| until > now)
    }
}

/// The shared primitive operations. One implementation per backing table.
///
/// Invariants every implementation must uphold:
///
/// 1. A row is never claimed by two owners simultaneously.
/// 2. Ack/abandon/fail from a stale owner has no effect.
/// 3. `reap_expired` is idempotent.
/// 4. Eligibility predicates use the store's clock, never the worker's.
/// 5. The retry counter is monotonic.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Atomically claim up to `batch_size` visible rows in due-time order
    /// (ties broken by creation order), setting owner and lease. Returns the
    /// claimed items.
    async fn claim(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> anyhow::Result<Vec<WorkItem>>;

    /// Complete rows still owned by `owner`. Stale ids are ignored.
    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> anyhow::Result<()>;

    /// Return owned rows to `FailedRetryable`, due again after `delay`, with
    /// the retry counter incremented. Stale ids are ignored.
    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        delay: Duration,
    ) -> anyhow::Result<()>;

    /// Poison owned rows. Terminal. Stale ids are ignored.
    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], error: &str) -> anyhow::Result<()>;

    /// Release any claimed row whose lease has expired back to
    /// `FailedRetryable`. Returns the number of rows reaped. Safe to run
    /// continuously.
    async fn reap_expired(&self) -> anyhow::Result<u64>;

    /// Dispatcher-side transient path: like abandon for a single row the
    /// dispatcher still owns, with an explicit delay.
    async fn reschedule(
        &self,
        owner: OwnerToken,
        id: Uuid,
        delay: Duration,
        last_error: &str,
    ) -> anyhow::Result<()>;

    /// Admin path: return a poisoned row to `Pending` with a reset retry
    /// counter. Returns false when the row is not poisoned.
    async fn replay_poisoned(&self, id: Uuid) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn item_at(now: DateTime<Utc>) -> WorkItem {
        WorkItem::new(Uuid::new_v4(), now, now)
    }

    #[test]
    fn pending_due_row_is_visible() {
        let now = Utc::now();
        let item = item_at(now);
        assert!(item.is_visible_at(now));
    }

    #[test]
    fn future_due_time_hides_row() {
        let now = Utc::now();
        let mut item = item_at(now);
        item.due_time_utc = now + ChronoDuration::seconds(30);
        assert!(!item.is_visible_at(now));
        assert!(item.is_visible_at(now + ChronoDuration::seconds(30)));
    }

    #[test]
    fn claimed_row_with_live_lock_is_hidden() {
        let now = Utc::now();
        let mut item = item_at(now);
        item.status = WorkItemStatus::Claimed;
        item.locked_until = Some(now + ChronoDuration::seconds(60));
        assert!(!item.is_visible_at(now));
        assert!(!item.is_reapable_at(now));
    }

    #[test]
    fn expired_claim_is_reapable_not_visible() {
        let now = Utc::now();
        let mut item = item_at(now);
        item.status = WorkItemStatus::Claimed;
        item.locked_until = Some(now - ChronoDuration::seconds(1));
        assert!(!item.is_visible_at(now));
        assert!(item.is_reapable_at(now));
    }

    #[test]
    fn failed_retryable_is_claimable_again() {
        let now = Utc::now();
        let mut item = item_at(now);
        item.status = WorkItemStatus::FailedRetryable;
        item.locked_until = None;
        assert!(item.is_visible_at(now));
    }

    #[test]
    fn ownership_requires_live_lease() {
        let now = Utc::now();
        let owner = OwnerToken::new();
        let mut item = item_at(now);
        item.status = WorkItemStatus::Claimed;
        item.owner_token = Some(owner);
        item.locked_until = Some(now + ChronoDuration::seconds(10));
        assert!(item.is_owned_by(owner, now));
        assert!(!item.is_owned_by(OwnerToken::new(), now));
        assert!(!item.is_owned_by(owner, now + ChronoDuration::seconds(11)));
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkItemStatus::Completed.is_terminal());
        assert!(WorkItemStatus::Poisoned.is_terminal());
        assert!(!WorkItemStatus::Claimed.is_terminal());
    }
}
