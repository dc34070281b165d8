// Worker services - the policy layer over the store contracts.
//
// Each worker is a cooperative loop: claim, process, ack/abandon/fail,
// sleep until the next tick. Cancellation comes top-down from the service
// host shutdown token, and for lease-holding workers also from the
// lease-lost signal. Every worker exposes its single pass as a public
// method so tests drive it directly with a manual clock.

pub mod discovery;
pub mod dispatcher;
pub mod fanout_worker;
pub mod inbox_worker;
pub mod reaper;
pub mod scheduler_worker;
pub mod watchdog_service;

pub use discovery::DiscoveryRefresher;
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use fanout_worker::FanoutWorker;
pub use inbox_worker::{InboxWorker, InboxWorkerConfig};
pub use reaper::Reaper;
pub use scheduler_worker::{SchedulerWorker, SchedulerWorkerConfig};
pub use watchdog_service::{OverdueJobsProbe, StuckInboxProbe, WatchdogService};

use std::time::Duration;

/// Sleep for the poll interval with proportional jitter, or return early on
/// shutdown.
pub(crate) async fn idle_sleep(
    interval: Duration,
    shutdown: &tokio_util::sync::CancellationToken,
) {
    let jitter_ms = (interval.as_millis() as u64 / 5).max(1);
    let delay = interval + Duration::from_millis(fastrand::u64(0..jitter_ms));
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
