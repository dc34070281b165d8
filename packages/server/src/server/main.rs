// Main entry point for the taskmill server

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::ingest::WebhookIngestor;
use server_core::kernel::{
    PgHealthCheck, ProcessCheck, ServerKernel, ServiceHost,
};
use server_core::server::{build_app, AppState};
use server_core::stores::{
    PgFanoutStore, PgIdempotencyStore, PgInboxStore, PgLeaseStore, PgMetricRecorder,
    PgOutboxStore, PgSchedulerStore,
};
use server_core::workers::{
    DiscoveryRefresher, DispatcherConfig, FanoutWorker, InboxWorker, InboxWorkerConfig,
    OutboxDispatcher, OverdueJobsProbe, Reaper, SchedulerWorker, SchedulerWorkerConfig,
    StuckInboxProbe, WatchdogService,
};
use server_core::Config;
use taskmill::exactly_once::ExactlyOnceExecutor;
use taskmill::handler::HandlerRegistry;
use taskmill::health::{CacheDurations, CachedHealthCheck, HealthBucket, HealthRegistry};
use taskmill::inbox::{HmacSha256Authenticator, JsonFieldClassifier};
use taskmill::startup::StartupLatchCheck;
use taskmill::watchdog::{TracingAlertSink, Watchdog, WatchdogConfig};
use taskmill::work_item::WorkQueue;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,taskmill=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting taskmill server");

    let config = Config::from_env().context("Failed to load configuration")?;
    let kernel = ServerKernel::bootstrap(config.clone())
        .await
        .context("Failed to bootstrap kernel")?;
    let startup = kernel.latch.register("store-wiring");

    // Stores over the primary database. Multi-tenant deployments build one
    // set per discovered pool and route by store key.
    let primary = kernel
        .pools
        .get(&taskmill::routing::StoreKey::from("primary"))
        .context("primary database pool missing")?;
    let pool = primary.pool.clone();
    let schema = primary.schema.as_str();

    let outbox = Arc::new(PgOutboxStore::new(pool.clone(), schema));
    let inbox = Arc::new(PgInboxStore::new(pool.clone(), schema));
    let scheduler = Arc::new(PgSchedulerStore::new(pool.clone(), schema));
    let fanout = Arc::new(PgFanoutStore::new(pool.clone(), schema));
    let leases = Arc::new(PgLeaseStore::new(pool.clone(), schema));
    let idempotency = Arc::new(PgIdempotencyStore::new(pool.clone(), schema));
    let metrics = Arc::new(PgMetricRecorder::new(pool.clone(), schema));

    // Handler registries. Applications register their topic and event-type
    // handlers here before the workers start.
    let outbox_handlers = Arc::new(HandlerRegistry::new());
    let inbox_handlers = Arc::new(HandlerRegistry::new());

    // Ingest surface.
    let authenticator = Arc::new(HmacSha256Authenticator::new(
        config
            .webhook_secret
            .clone()
            .context("WEBHOOK_SECRET must be set to serve webhooks")?
            .into_bytes(),
        "X-Signature",
    ));
    let ingestor = Arc::new(WebhookIngestor::new(
        authenticator,
        vec![Arc::new(JsonFieldClassifier::new("generic"))],
        inbox.clone(),
        kernel.clock.clone(),
        metrics.clone(),
    ));

    // Health buckets.
    let mut health = HealthRegistry::new();
    health.register(Arc::new(ProcessCheck), &[HealthBucket::Live]);
    health.register(
        Arc::new(StartupLatchCheck::new(kernel.latch.clone())),
        &[HealthBucket::Ready],
    );
    health.register(
        Arc::new(CachedHealthCheck::new(
            Arc::new(PgHealthCheck::new(pool.clone())),
            CacheDurations::default(),
            kernel.clock.clone(),
        )),
        &[HealthBucket::Ready, HealthBucket::Dep],
    );

    // Workers.
    let dispatcher = OutboxDispatcher::single(
        outbox.clone(),
        outbox_handlers,
        DispatcherConfig {
            batch_size: config.dispatcher_batch_size,
            poll_interval: config.poll_interval,
            lease_duration: config.lease_duration,
            retry: taskmill::backoff::RetryPolicy {
                max_attempts: config.max_attempts,
            },
            ..Default::default()
        },
        metrics.clone(),
    );
    let inbox_worker = InboxWorker::new(
        inbox.clone(),
        inbox_handlers,
        Arc::new(ExactlyOnceExecutor::new(idempotency)),
        InboxWorkerConfig {
            poll_interval: config.poll_interval,
            lease_duration: config.lease_duration,
            ..Default::default()
        },
        metrics.clone(),
    );
    let scheduler_worker = SchedulerWorker::new(
        scheduler.clone(),
        outbox.clone(),
        leases.clone(),
        SchedulerWorkerConfig::default(),
        metrics.clone(),
    );
    let fanout_worker = FanoutWorker::new(
        fanout,
        outbox.clone(),
        leases.clone(),
        kernel.clock.clone(),
        metrics.clone(),
    );
    // Reaper cadence must stay below the shortest lease in use.
    let reaper = Reaper::new(
        vec![
            ("outbox", outbox.clone() as Arc<dyn WorkQueue>),
            ("inbox", inbox.clone() as Arc<dyn WorkQueue>),
            ("job_runs", scheduler.clone() as Arc<dyn WorkQueue>),
        ],
        config.lease_duration / 3,
        metrics.clone(),
    );
    let watchdog = WatchdogService::new(Arc::new(Watchdog::new(
        vec![
            Arc::new(OverdueJobsProbe::new(
                scheduler.clone(),
                chrono::Duration::minutes(5),
            )),
            Arc::new(StuckInboxProbe::new(
                inbox.clone(),
                chrono::Duration::minutes(15),
            )),
        ],
        vec![Arc::new(TracingAlertSink)],
        WatchdogConfig::default(),
        kernel.clock.clone(),
    )));

    let host = ServiceHost::new()
        .with_service(dispatcher)
        .with_service(inbox_worker)
        .with_service(scheduler_worker)
        .with_service(fanout_worker)
        .with_service(reaper)
        .with_service(watchdog)
        .with_service(DiscoveryRefresher::new(
            kernel.pools.clone(),
            config.discovery_refresh,
        ));
    let shutdown = host.shutdown_token();

    // HTTP surface.
    let app = build_app(AppState {
        ingestor,
        health,
    });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {addr}");
    tracing::info!("Health checks: /healthz /readyz /health/dep");

    let http_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    drop(startup); // wiring complete; /readyz flips healthy

    host.run_until_shutdown().await?;
    http.await?.context("HTTP server error")?;

    Ok(())
}
