//! Concrete health checks for the HTTP buckets.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use taskmill::health::{CheckResult, HealthCheck};

/// Database connectivity and responsiveness.
pub struct PgHealthCheck {
    pool: PgPool,
    timeout: Duration,
}

impl PgHealthCheck {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl HealthCheck for PgHealthCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> CheckResult {
        match tokio::time::timeout(self.timeout, sqlx::query("SELECT 1").execute(&self.pool)).await
        {
            Ok(Ok(_)) => CheckResult::healthy("database reachable").with_data(serde_json::json!({
                "pool_size": self.pool.size(),
                "idle": self.pool.num_idle(),
            })),
            Ok(Err(e)) => CheckResult::unhealthy(format!("query failed: {e}")),
            Err(_) => CheckResult::unhealthy(format!("query timeout (>{:?})", self.timeout)),
        }
    }
}

/// Process liveness; always healthy once the process answers at all.
pub struct ProcessCheck;

#[async_trait]
impl HealthCheck for ProcessCheck {
    fn name(&self) -> &str {
        "process"
    }

    async fn check(&self) -> CheckResult {
        CheckResult::healthy("process alive")
    }
}
