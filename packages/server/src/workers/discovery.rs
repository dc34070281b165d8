//! Periodic store-discovery refresh.
//!
//! Re-runs discovery on a fixed period (default five minutes) and applies
//! the diff to the provider. Refresh errors keep the current store set; the
//! next cycle tries again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use taskmill::routing::StoreProvider;

use crate::kernel::service_host::Service;
use crate::workers::idle_sleep;

pub struct DiscoveryRefresher<T: ?Sized + 'static> {
    provider: Arc<StoreProvider<T>>,
    period: Duration,
}

impl<T: ?Sized + 'static> DiscoveryRefresher<T> {
    pub fn new(provider: Arc<StoreProvider<T>>, period: Duration) -> Self {
        Self { provider, period }
    }
}

#[async_trait::async_trait]
impl<T: ?Sized + Send + Sync + 'static> Service for DiscoveryRefresher<T> {
    fn name(&self) -> &'static str {
        "discovery-refresher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            idle_sleep(self.period, &shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.provider.refresh().await {
                warn!(error = %e, "discovery refresh failed; keeping current stores");
            }
        }
        Ok(())
    }
}
