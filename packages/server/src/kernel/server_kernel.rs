// ServerKernel - process-wide infrastructure handle
//
// Holds the per-database pool set, the clock, and the startup latch.
// Workers and routes receive it as an Arc.

use std::sync::Arc;

use taskmill::clock::SharedClock;
use taskmill::routing::{StaticDiscovery, StoreDescriptor, StoreKey, StoreProvider};
use taskmill::startup::StartupLatch;

use crate::config::Config;
use crate::kernel::pools::{PgPoolFactory, PoolSet};

/// Everything the workers and routes share.
pub struct ServerKernel {
    pub config: Config,
    pub pools: Arc<StoreProvider<PoolSet>>,
    pub clock: SharedClock,
    pub latch: StartupLatch,
}

impl ServerKernel {
    /// Build a kernel over a static single-database deployment. Multi-tenant
    /// deployments swap the discovery source and call the same constructor.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Arc<Self>> {
        let discovery = Arc::new(StaticDiscovery::new(vec![StoreDescriptor {
            key: StoreKey::from("primary"),
            connection_string: config.database_url.clone(),
        }])?);
        let factory = Arc::new(PgPoolFactory::new(config.schema.clone()));
        let pools = Arc::new(StoreProvider::bootstrap(discovery, factory).await?);

        Ok(Arc::new(Self {
            config,
            pools,
            clock: taskmill::clock::system_clock(),
            latch: StartupLatch::new(),
        }))
    }
}
