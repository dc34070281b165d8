//! PostgreSQL idempotency store.
//!
//! `try_begin` is one upsert: insert admits a fresh key, the conditional
//! update re-opens a failed one, and a returned row is the admission
//! signal. `in_progress` and `completed` keys return no row and the caller
//! is refused.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use taskmill::exactly_once::{IdempotencyState, IdempotencyStore};

pub struct PgIdempotencyStore {
    pool: PgPool,
    schema: String,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_begin(&self, key: &str) -> anyhow::Result<bool> {
        let admitted: Option<String> = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {schema}.idempotency (key, state, created_at)
            VALUES ($1, 'in_progress', NOW())
            ON CONFLICT (key) DO UPDATE SET state = 'in_progress'
            WHERE idempotency.state = 'failed'
            RETURNING key
            "#,
            schema = self.schema,
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(admitted.is_some())
    }

    async fn complete(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "UPDATE {schema}.idempotency SET state = 'completed' WHERE key = $1",
            schema = self.schema,
        ))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "UPDATE {schema}.idempotency SET state = 'failed' WHERE key = $1",
            schema = self.schema,
        ))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn state(&self, key: &str) -> anyhow::Result<Option<IdempotencyState>> {
        let state: Option<String> = sqlx::query_scalar(&format!(
            "SELECT state FROM {schema}.idempotency WHERE key = $1",
            schema = self.schema,
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        state
            .map(|raw| match raw.as_str() {
                "in_progress" => Ok(IdempotencyState::InProgress),
                "completed" => Ok(IdempotencyState::Completed),
                "failed" => Ok(IdempotencyState::Failed),
                other => anyhow::bail!("unknown idempotency state {other:?}"),
            })
            .transpose()
    }

    async fn sweep(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {schema}.idempotency WHERE state = 'completed' AND created_at < $1",
            schema = self.schema,
        ))
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
