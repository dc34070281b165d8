//! Transactional outbox: message shape, store contract, saga joins.
//!
//! A producer enqueues in the same database transaction as its business
//! write, so the message commits atomically with the domain change. A
//! dispatcher claims due messages through the shared work-queue engine and
//! drives them to a terminal state.
//!
//! # Guarantees
//!
//! - **At-least-once dispatch**: messages may be re-delivered after a
//!   dispatcher crash; handlers must be idempotent or wrapped in the
//!   exactly-once executor keyed by [`MessageId`].
//! - **Stable producer identity**: `message_id` carries a unique index;
//!   enqueueing a duplicate returns the existing row instead of erroring.
//! - **Per-due-time FIFO**: within one outbox, equal due times dispatch in
//!   insertion order. No cross-topic ordering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{CorrelationId, JoinId, MessageId};
use crate::work_item::{WorkItem, WorkQueue};

/// A message persisted in an outbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub item: WorkItem,
    pub message_id: MessageId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    pub join_id: Option<JoinId>,
}

/// Options for enqueue beyond topic and payload.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Producer-stable identity; generated when absent.
    pub message_id: Option<MessageId>,
    pub correlation_id: CorrelationId,
    /// Deliver no earlier than this instant; immediate when absent.
    pub due_time: Option<DateTime<Utc>>,
    pub join_id: Option<JoinId>,
}

impl EnqueueOptions {
    pub fn with_message_id(message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..Default::default()
        }
    }
}

/// Result of an enqueue that handles producer retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new row was inserted.
    Created(MessageId),
    /// A row with this `message_id` already exists; nothing was written.
    Duplicate(MessageId),
}

impl EnqueueResult {
    pub fn message_id(&self) -> MessageId {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Store contract for one database's outbox.
///
/// Implementations also expose the shared [`WorkQueue`] operations over the
/// same table; `claim_due` etc. are provided through that trait. SQL stores
/// additionally expose a transactional enqueue taking the caller's open
/// transaction (a concrete-type API outside this trait).
#[async_trait]
pub trait OutboxStore: WorkQueue {
    async fn enqueue(
        &self,
        topic: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> anyhow::Result<EnqueueResult>;

    /// Load full messages for claimed work items.
    async fn load(&self, ids: &[Uuid]) -> anyhow::Result<Vec<OutboxMessage>>;

    async fn get(&self, message_id: MessageId) -> anyhow::Result<Option<OutboxMessage>>;

    /// Delete completed rows processed before `older_than`. Returns rows
    /// removed. Run from scheduler housekeeping.
    async fn sweep_dispatched(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;
}

// =============================================================================
// Saga joins
// =============================================================================

/// State of a join aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Open,
    Completed,
    Failed,
}

/// Per-member terminal report inside a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Attached,
    Completed,
    Failed,
}

/// A saga-style aggregate over multiple outbox messages. Terminates when all
/// expected steps report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxJoin {
    pub join_id: JoinId,
    pub tenant_id: String,
    pub expected_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: JoinStatus,
    /// Caller-owned; carries the continuation policy. Never interpreted by
    /// the platform.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OutboxJoin {
    /// Apply one step report and return the status after it.
    ///
    /// The transition to a terminal status happens exactly when
    /// `completed + failed == expected`; reports past that point are
    /// rejected by stores (the row is already terminal).
    pub fn apply_step(&mut self, completed: bool) -> JoinStatus {
        if completed {
            self.completed_steps += 1;
        } else {
            self.failed_steps += 1;
        }
        if self.completed_steps + self.failed_steps >= self.expected_steps {
            self.status = if self.failed_steps == 0 {
                JoinStatus::Completed
            } else {
                JoinStatus::Failed
            };
        }
        self.status
    }
}

/// What a step report did to the join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTransition {
    /// The join is still waiting on steps.
    StillOpen,
    /// This report closed the join. The caller decides what to enqueue,
    /// using the metadata it attached at `start_join`.
    Closed {
        status: JoinStatus,
        metadata: serde_json::Value,
    },
}

/// Store contract for join aggregates.
#[async_trait]
pub trait JoinStore: Send + Sync {
    async fn start_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: serde_json::Value,
    ) -> anyhow::Result<JoinId>;

    async fn attach_message(&self, join_id: JoinId, message_id: MessageId) -> anyhow::Result<()>;

    /// Record a member's terminal state and advance the join. Reports for an
    /// already-terminal join or an unknown member are errors.
    async fn report_step(
        &self,
        join_id: JoinId,
        message_id: MessageId,
        completed: bool,
    ) -> anyhow::Result<JoinTransition>;

    async fn get_join(&self, join_id: JoinId) -> anyhow::Result<Option<OutboxJoin>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_join(expected: i32) -> OutboxJoin {
        OutboxJoin {
            join_id: JoinId::new(),
            tenant_id: "tenant-a".into(),
            expected_steps: expected,
            completed_steps: 0,
            failed_steps: 0,
            status: JoinStatus::Open,
            metadata: serde_json::json!({"continuation": "orders.settled"}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn join_completes_when_all_steps_succeed() {
        let mut join = open_join(3);
        assert_eq!(join.apply_step(true), JoinStatus::Open);
        assert_eq!(join.apply_step(true), JoinStatus::Open);
        assert_eq!(join.apply_step(true), JoinStatus::Completed);
    }

    #[test]
    fn any_failed_step_fails_the_join() {
        let mut join = open_join(2);
        assert_eq!(join.apply_step(false), JoinStatus::Open);
        assert_eq!(join.apply_step(true), JoinStatus::Failed);
        assert_eq!(join.completed_steps, 1);
        assert_eq!(join.failed_steps, 1);
    }

    #[test]
    fn single_step_join_closes_immediately() {
        let mut join = open_join(1);
        assert_eq!(join.apply_step(true), JoinStatus::Completed);
    }

    #[test]
    fn enqueue_result_accessors() {
        let id = MessageId::new();
        assert!(EnqueueResult::Created(id).is_created());
        assert!(!EnqueueResult::Duplicate(id).is_created());
        assert_eq!(EnqueueResult::Duplicate(id).message_id(), id);
    }
}
