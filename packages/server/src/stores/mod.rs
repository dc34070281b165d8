// PostgreSQL implementations of the taskmill store contracts.
//
// Every mutating statement reads time via NOW() so the database clock is
// the only clock in any eligibility predicate. Claims use the
// `WITH ... FOR UPDATE SKIP LOCKED` CTE shape throughout.

pub mod fanout;
pub mod idempotency;
pub mod inbox;
pub mod lease;
pub mod metrics;
pub mod outbox;
pub mod scheduler;
pub mod work_queue;

pub use fanout::PgFanoutStore;
pub use idempotency::PgIdempotencyStore;
pub use inbox::PgInboxStore;
pub use lease::PgLeaseStore;
pub use metrics::PgMetricRecorder;
pub use outbox::PgOutboxStore;
pub use scheduler::PgSchedulerStore;
pub use work_queue::SqlWorkQueue;
