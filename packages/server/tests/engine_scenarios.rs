//! End-to-end scenarios over the in-memory stores.
//!
//! These drive the real worker passes (dispatcher, inbox worker, scheduler,
//! fanout) against the engine's in-memory stores with a manual clock, so
//! time advances by assertion instead of sleeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use server_core::workers::{
    DispatcherConfig, FanoutWorker, InboxWorker, InboxWorkerConfig, OutboxDispatcher,
    SchedulerWorker, SchedulerWorkerConfig, StuckInboxProbe,
};
use taskmill::backoff::{BackoffPolicy, RetryPolicy};
use taskmill::clock::{Clock, ManualClock, SharedClock};
use taskmill::error::HandlerOutcome;
use taskmill::exactly_once::{ExactlyOnceExecutor, InMemoryIdempotencyStore};
use taskmill::fanout::{FanoutPolicy, FanoutStore};
use taskmill::handler::HandlerRegistry;
use taskmill::id::{CorrelationId, JobId, MessageId};
use taskmill::inbox::{DedupeKey, InboxStore, NewInboxEvent};
use taskmill::lease::{FencingGuard, LeaseConfig, LeaseHandle, LockStore};
use taskmill::metrics::NullRecorder;
use taskmill::outbox::{EnqueueOptions, EnqueueResult, OutboxStore};
use taskmill::scheduler::{CronJob, SchedulerStore};
use taskmill::testing::{InMemoryFanout, InMemoryInbox, InMemoryLeases, InMemoryOutbox, InMemoryScheduler};
use taskmill::watchdog::WatchdogProbe;
use taskmill::work_item::WorkItemStatus;

fn manual_clock() -> (ManualClock, SharedClock) {
    let clock = ManualClock::start_now();
    let shared: SharedClock = Arc::new(clock.clone());
    (clock, shared)
}

fn dispatcher_with(
    outbox: Arc<InMemoryOutbox>,
    registry: Arc<HandlerRegistry>,
    max_attempts: u32,
) -> OutboxDispatcher {
    OutboxDispatcher::single(
        outbox,
        registry,
        DispatcherConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(60),
            safety_margin: Duration::from_secs(5),
            backoff: BackoffPolicy::fixed(Duration::from_secs(60)),
            retry: RetryPolicy { max_attempts },
        },
        Arc::new(NullRecorder),
    )
}

// S1: a successful handler completes the row on the first pass.
#[tokio::test]
async fn dispatch_success_completes_within_one_pass() {
    let (_, clock) = manual_clock();
    let outbox = Arc::new(InMemoryOutbox::new(clock));
    let registry = Arc::new(HandlerRegistry::new());
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in = handled.clone();
    registry.register_fn("orders.created", move |_payload, _ctx| {
        let handled = handled_in.clone();
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Success)
        }
    });

    outbox
        .enqueue(
            "orders.created",
            serde_json::json!({"payload": "P"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let dispatcher = dispatcher_with(outbox.clone(), registry, 5);
    let processed = dispatcher.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(processed, 1);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    let row = &outbox.snapshot()[0];
    assert_eq!(row.item.status, WorkItemStatus::Completed);
    assert_eq!(row.item.retry_count, 0);
}

// S2: duplicate message ids collapse to one row and one domain effect.
#[tokio::test]
async fn duplicate_message_id_yields_single_effect() {
    let (_, clock) = manual_clock();
    let outbox = Arc::new(InMemoryOutbox::new(clock.clone()));
    let registry = Arc::new(HandlerRegistry::new());
    let executor = Arc::new(ExactlyOnceExecutor::new(Arc::new(
        InMemoryIdempotencyStore::new(clock),
    )));
    let effects = Arc::new(AtomicUsize::new(0));

    let effects_in = effects.clone();
    registry.register_fn("payments.capture", move |payload, _ctx| {
        let executor = executor.clone();
        let effects = effects_in.clone();
        async move {
            let key = payload["messageId"].as_str().unwrap_or_default().to_string();
            executor
                .execute(&key, || async {
                    effects.fetch_add(1, Ordering::SeqCst);
                    taskmill::exactly_once::OperationResult::Success
                })
                .await?;
            Ok(HandlerOutcome::Success)
        }
    });

    let message_id = MessageId::new();
    let payload = serde_json::json!({"messageId": message_id.to_string()});
    let first = outbox
        .enqueue(
            "payments.capture",
            payload.clone(),
            EnqueueOptions::with_message_id(message_id),
        )
        .await
        .unwrap();
    let second = outbox
        .enqueue(
            "payments.capture",
            payload,
            EnqueueOptions::with_message_id(message_id),
        )
        .await
        .unwrap();
    assert!(first.is_created());
    assert_eq!(second, EnqueueResult::Duplicate(message_id));

    let dispatcher = dispatcher_with(outbox.clone(), registry, 5);
    dispatcher.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(effects.load(Ordering::SeqCst), 1);
    let rows = outbox.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].item.status, WorkItemStatus::Completed);
}

// S3: transient-then-success completes after the backoff elapses.
#[tokio::test]
async fn transient_failure_retries_after_backoff() {
    let (clock, shared) = manual_clock();
    let outbox = Arc::new(InMemoryOutbox::new(shared));
    let registry = Arc::new(HandlerRegistry::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in = attempts.clone();
    registry.register_fn("sync.push", move |_payload, _ctx| {
        let attempts = attempts_in.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(HandlerOutcome::Transient(Some(Duration::from_secs(60))))
            } else {
                Ok(HandlerOutcome::Success)
            }
        }
    });

    outbox
        .enqueue("sync.push", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let dispatcher = dispatcher_with(outbox.clone(), registry, 5);
    let shutdown = CancellationToken::new();

    dispatcher.run_once(&shutdown).await.unwrap();
    {
        let row = &outbox.snapshot()[0];
        assert_eq!(row.item.status, WorkItemStatus::FailedRetryable);
        assert_eq!(row.item.retry_count, 1);
    }

    // Not yet due: nothing to claim.
    assert_eq!(dispatcher.run_once(&shutdown).await.unwrap(), 0);

    clock.advance(chrono::Duration::seconds(61));
    dispatcher.run_once(&shutdown).await.unwrap();
    let row = &outbox.snapshot()[0];
    assert_eq!(row.item.status, WorkItemStatus::Completed);
    assert_eq!(row.item.retry_count, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// S4: two dispatchers race one row; exactly one processes it.
#[tokio::test]
async fn racing_dispatchers_claim_exclusively() {
    let (_, clock) = manual_clock();
    let outbox = Arc::new(InMemoryOutbox::new(clock));
    let registry = Arc::new(HandlerRegistry::new());
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in = handled.clone();
    registry.register_fn("solo.topic", move |_payload, _ctx| {
        let handled = handled_in.clone();
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Success)
        }
    });

    outbox
        .enqueue("solo.topic", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let first = dispatcher_with(outbox.clone(), registry.clone(), 5);
    let second = dispatcher_with(outbox.clone(), registry, 5);
    let shutdown = CancellationToken::new();

    let processed_first = first.run_once(&shutdown).await.unwrap();
    let processed_second = second.run_once(&shutdown).await.unwrap();

    assert_eq!(processed_first, 1);
    assert_eq!(processed_second, 0);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

// Exhausted retries poison the row.
#[tokio::test]
async fn exhausted_retries_poison_the_row() {
    let (clock, shared) = manual_clock();
    let outbox = Arc::new(InMemoryOutbox::new(shared));
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("always.failing", |_payload, _ctx| async {
        Ok(HandlerOutcome::Transient(None))
    });

    outbox
        .enqueue(
            "always.failing",
            serde_json::json!({}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let dispatcher = dispatcher_with(outbox.clone(), registry, 2);
    let shutdown = CancellationToken::new();

    dispatcher.run_once(&shutdown).await.unwrap(); // attempt 1 -> retryable
    clock.advance(chrono::Duration::seconds(61));
    dispatcher.run_once(&shutdown).await.unwrap(); // attempt 2 -> poisoned

    let row = &outbox.snapshot()[0];
    assert_eq!(row.item.status, WorkItemStatus::Poisoned);
    assert_eq!(row.item.retry_count, 1);
}

// A message with no registered handler is poisoned, not retried forever.
#[tokio::test]
async fn unroutable_message_is_poisoned() {
    let (_, clock) = manual_clock();
    let outbox = Arc::new(InMemoryOutbox::new(clock));
    let registry = Arc::new(HandlerRegistry::new());

    outbox
        .enqueue("nobody.home", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let dispatcher = dispatcher_with(outbox.clone(), registry, 5);
    dispatcher.run_once(&CancellationToken::new()).await.unwrap();

    let row = &outbox.snapshot()[0];
    assert_eq!(row.item.status, WorkItemStatus::Poisoned);
}

// S5: partition, takeover, fencing rejection, lost signal.
#[tokio::test]
async fn lease_loss_fences_out_the_old_holder() {
    let (clock, shared) = manual_clock();
    let leases = Arc::new(InMemoryLeases::new(shared));
    let guard = FencingGuard::new();

    let handle = LeaseHandle::acquire(
        leases.clone(),
        "resourceA",
        LeaseConfig {
            duration: Duration::from_secs(30),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .expect("first acquire succeeds");
    let t1 = handle.fencing_token();
    guard.admit("resourceA", t1).unwrap();

    // Partition: renewals stop reaching the store, the lease expires.
    leases.set_fail_renews(true);
    clock.advance(chrono::Duration::seconds(31));

    // Another process takes over with a higher token.
    let t2 = LockStore::acquire(
        leases.as_ref(),
        "resourceA",
        taskmill::id::OwnerToken::new(),
        Duration::from_secs(30),
        None,
    )
    .await
    .unwrap()
    .expect("takeover after expiry");
    assert!(t2 > t1);
    guard.admit("resourceA", t2).unwrap();

    // The old holder notices on its next renewal and is fenced out.
    assert!(!handle.try_renew_now().await);
    assert!(handle.is_lost());
    assert!(handle.lost_signal().is_cancelled());
    assert!(handle.ensure_held().is_err());
    assert!(guard.admit("resourceA", t1).is_err());
}

// S7 background half: the inbox worker processes an ingested event exactly
// once across redeliveries.
#[tokio::test]
async fn inbox_worker_processes_exactly_once() {
    let (_, clock) = manual_clock();
    let inbox = Arc::new(InMemoryInbox::new(clock.clone()));
    let registry = Arc::new(HandlerRegistry::new());
    let effects = Arc::new(AtomicUsize::new(0));
    let effects_in = effects.clone();
    registry.register_fn("invoice.paid", move |_payload, _ctx| {
        let effects = effects_in.clone();
        async move {
            effects.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Success)
        }
    });

    let worker = InboxWorker::new(
        inbox.clone(),
        registry,
        Arc::new(ExactlyOnceExecutor::new(Arc::new(
            InMemoryIdempotencyStore::new(clock),
        ))),
        InboxWorkerConfig::default(),
        Arc::new(NullRecorder),
    );

    let event = NewInboxEvent::new(
        DedupeKey::from_event_id("stripe", "evt-77"),
        "invoice.paid",
        serde_json::json!({"amount": 100}),
        serde_json::json!({}),
        b"body",
    );
    inbox.ingest(event.clone()).await.unwrap();
    // Provider redelivers before processing; still one row.
    inbox.ingest(event).await.unwrap();

    let shutdown = CancellationToken::new();
    let processed = worker.run_once(&shutdown).await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(effects.load(Ordering::SeqCst), 1);

    let rows = inbox.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].item.status, WorkItemStatus::Completed);
}

// Scheduler: due jobs materialize exactly one run per instant, runs
// delegate to the outbox, timers fire once.
#[tokio::test]
async fn scheduler_materializes_and_delegates_runs() {
    let (clock, shared) = manual_clock();
    let scheduler = Arc::new(InMemoryScheduler::new(shared.clone()));
    let outbox = Arc::new(InMemoryOutbox::new(shared.clone()));
    let leases = Arc::new(InMemoryLeases::new(shared));

    let job_id = JobId::new();
    scheduler
        .upsert_job(CronJob {
            job_id,
            job_name: "nightly-report".into(),
            cron_schedule: "*/5 * * * *".into(),
            topic: "reports.generate".into(),
            payload: serde_json::json!({"report": "nightly"}),
            is_enabled: true,
            next_due_time: None,
            last_run_time: None,
            last_run_status: None,
        })
        .await
        .unwrap();

    let worker = SchedulerWorker::new(
        scheduler.clone(),
        outbox.clone(),
        leases,
        SchedulerWorkerConfig::default(),
        Arc::new(NullRecorder),
    );

    // First pass seeds next_due_time.
    worker.leader_pass(clock.now()).await.unwrap();
    let due = scheduler.list_enabled_jobs().await.unwrap()[0]
        .next_due_time
        .expect("seeded");

    // Jump past the due instant; two leader passes must not double-run.
    clock.set(due + chrono::Duration::seconds(1));
    worker.leader_pass(clock.now()).await.unwrap();
    worker.leader_pass(clock.now()).await.unwrap();
    assert_eq!(scheduler.runs_for_job(job_id).await.unwrap().len(), 1);

    // Run execution delegates to the job's topic.
    let processed = worker.run_executor_pass().await.unwrap();
    assert_eq!(processed, 1);
    assert_eq!(outbox.on_topic("reports.generate").len(), 1);

    // Timers fire once and dedupe on the timer id.
    scheduler
        .create_timer(
            clock.now() - chrono::Duration::seconds(1),
            "billing.remind",
            serde_json::json!({"invoice": 9}),
            CorrelationId::new(),
        )
        .await
        .unwrap();
    worker.leader_pass(clock.now()).await.unwrap();
    worker.leader_pass(clock.now()).await.unwrap();
    assert_eq!(outbox.on_topic("billing.remind").len(), 1);
}

// Fanout: elapsed windows emit one slice each and the cursor advances.
#[tokio::test]
async fn fanout_emits_bounded_windows_per_shard() {
    let (clock, shared) = manual_clock();
    let fanout = Arc::new(InMemoryFanout::new());
    let outbox = Arc::new(InMemoryOutbox::new(shared.clone()));
    let leases = Arc::new(InMemoryLeases::new(shared.clone()));

    let policy = FanoutPolicy {
        max_catchup_windows: 3,
        ..FanoutPolicy::every("billing", 300)
    };
    fanout.upsert_policy(policy.clone()).await.unwrap();
    fanout.register_shard("billing", "shard-0").await.unwrap();
    fanout.register_shard("billing", "shard-1").await.unwrap();

    let worker = FanoutWorker::new(
        fanout.clone(),
        outbox.clone(),
        leases,
        shared,
        Arc::new(NullRecorder),
    );

    let emitted = worker.run_once().await.unwrap();
    assert_eq!(emitted, 2); // one current window per shard

    // Immediately ticking again emits nothing new.
    assert_eq!(worker.run_once().await.unwrap(), 0);

    // After two intervals, each shard emits the elapsed windows in order.
    clock.advance(chrono::Duration::seconds(600));
    let emitted = worker.run_once().await.unwrap();
    assert_eq!(emitted, 4);

    let slices = outbox.on_topic("fanout:billing:default");
    assert_eq!(slices.len(), 6);
    for slice in slices {
        let parsed: taskmill::envelope::FanoutSlice =
            serde_json::from_value(slice.payload).unwrap();
        assert_eq!(parsed.fanout_topic, "billing");
    }
}

// Watchdog: stuck inbox rows surface as alerts.
#[tokio::test]
async fn stuck_inbox_rows_raise_watchdog_alerts() {
    let (clock, shared) = manual_clock();
    let inbox = Arc::new(InMemoryInbox::new(shared));
    inbox
        .ingest(NewInboxEvent::new(
            DedupeKey::from_event_id("stripe", "evt-stuck"),
            "invoice.paid",
            serde_json::json!({}),
            serde_json::json!({}),
            b"body",
        ))
        .await
        .unwrap();

    let probe = StuckInboxProbe::new(inbox, chrono::Duration::minutes(15));
    assert!(probe.scan(clock.now()).await.unwrap().is_empty());

    clock.advance(chrono::Duration::minutes(16));
    let alerts = probe.scan(clock.now()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].message.contains("1 inbox rows"));
}
