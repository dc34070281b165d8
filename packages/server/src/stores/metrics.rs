//! Minute-bucketed metric points in PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use sqlx::PgPool;
use tracing::warn;

use taskmill::metrics::MetricRecorder;

/// Aggregates points into `(name, minute)` buckets. Recording failures are
/// logged and dropped; metrics must never take a worker down.
pub struct PgMetricRecorder {
    pool: PgPool,
    schema: String,
}

impl PgMetricRecorder {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }
}

#[async_trait]
impl MetricRecorder for PgMetricRecorder {
    async fn record(&self, name: &'static str, value: f64, at: DateTime<Utc>) {
        let minute = at
            .duration_trunc(chrono::Duration::minutes(1))
            .unwrap_or(at);
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.metric_point_minute (name, bucket_minute, value, samples)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (name, bucket_minute) DO UPDATE SET
                value = metric_point_minute.value + EXCLUDED.value,
                samples = metric_point_minute.samples + 1
            "#,
            schema = self.schema,
        ))
        .bind(name)
        .bind(minute)
        .bind(value)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(metric = name, error = %e, "failed to record metric point");
        }
    }
}
