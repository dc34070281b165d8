//! Per-database connection pools.
//!
//! Discovery hands the provider connection strings; the factory turns each
//! into a lazily-connecting `PgPool` so refresh cycles never block on
//! network I/O. Replacing a descriptor replaces the pool; the old pool
//! drains as its last references drop.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use taskmill::routing::{StoreDescriptor, StoreFactory};

/// A pool plus the schema its platform tables live in.
#[derive(Clone)]
pub struct PoolSet {
    pub pool: PgPool,
    pub schema: String,
}

/// Builds lazily-connecting pools for discovered databases.
pub struct PgPoolFactory {
    pub schema: String,
    pub max_connections: u32,
}

impl PgPoolFactory {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            max_connections: 10,
        }
    }
}

impl StoreFactory<PoolSet> for PgPoolFactory {
    fn build(&self, descriptor: &StoreDescriptor) -> anyhow::Result<Arc<PoolSet>> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_lazy(&descriptor.connection_string)?;
        Ok(Arc::new(PoolSet {
            pool,
            schema: self.schema.clone(),
        }))
    }
}
