//! # Taskmill
//!
//! Transactional work-queue primitives for SQL-backed background processing.
//! The database is the broker: producers enqueue in the same transaction as
//! their business writes, workers claim under leases with skip-locked
//! semantics, and every side effect can be fenced and deduplicated.
//!
//! ## Architecture
//!
//! ```text
//! Producer tx ──► Outbox ──┐
//! Webhook ────► Inbox ─────┤        claim / ack / abandon / fail / reap
//! Cron leader ─► JobRuns ──┼──► WorkQueue engine ──► workers ──► handlers
//! Timers ──────► Outbox ───┘              │                        │
//!                                         │                 ExactlyOnceExecutor
//!                                   LeaseHandle ◄── LockStore (fencing tokens)
//! ```
//!
//! ## Key invariants
//!
//! 1. **Single claim** — a row is owned by at most one worker at a time;
//!    ownership is proven by owner token and bounded by `locked_until`.
//! 2. **Stale owners are no-ops** — ack/abandon/fail after lease expiry
//!    changes nothing.
//! 3. **Fencing tokens never decrease** — downstream stores reject writers
//!    presenting a token below the highest seen per resource.
//! 4. **At-most-one effect per key** — handlers wrapped in the exactly-once
//!    executor produce 0 or 1 successful domain effects across retries.
//! 5. **Server time only** — eligibility predicates evaluate against the
//!    store's clock, never a worker's.
//!
//! This crate owns interfaces and portable machinery. Policy (polling
//! cadence, batch sizes, which database to poll next) and the SQL store
//! implementations live in the server crate.

pub mod backoff;
pub mod clock;
pub mod envelope;
pub mod error;
pub mod exactly_once;
pub mod fanout;
pub mod handler;
pub mod health;
pub mod id;
pub mod inbox;
pub mod lease;
pub mod metrics;
pub mod outbox;
pub mod routing;
pub mod scheduler;
pub mod startup;
pub mod testing;
pub mod watchdog;
pub mod work_item;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{HandlerOutcome, TaskmillError};
pub use exactly_once::{
    ExactlyOnceExecutor, ExecutionVerdict, IdempotencyState, IdempotencyStore, OperationResult,
    SideEffectProbe,
};
pub use handler::{HandlerContext, HandlerRegistry, MessageHandler};
pub use id::{CorrelationId, JobId, JoinId, MessageId, OwnerToken, RunId, TimerId};
pub use lease::{
    CoarseLeaseStore, FencingGuard, FencingToken, LeaseConfig, LeaseHandle, LockStore,
};
pub use outbox::{EnqueueOptions, EnqueueResult, JoinStore, OutboxMessage, OutboxStore};
pub use routing::{
    DiscoverySource, DrainFirst, RoundRobin, Router, SelectionStrategy, StaticDiscovery,
    StoreDescriptor, StoreKey, StoreProvider,
};
pub use work_item::{WorkItem, WorkItemStatus, WorkQueue};
