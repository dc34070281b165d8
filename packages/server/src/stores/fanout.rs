//! PostgreSQL fanout policies and cursors.
//!
//! Cursor advancement is compare-and-set on the previous window start, so
//! two ticks racing the same shard emit each window once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use taskmill::fanout::{FanoutCursor, FanoutPolicy, FanoutStore};

pub struct PgFanoutStore {
    pool: PgPool,
    schema: String,
}

impl PgFanoutStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }
}

#[async_trait]
impl FanoutStore for PgFanoutStore {
    async fn list_policies(&self) -> anyhow::Result<Vec<FanoutPolicy>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT fanout_topic, cron, default_every_seconds, jitter_seconds,
                   lease_seconds, work_key, max_catchup_windows
            FROM {schema}.fanout_policy
            ORDER BY fanout_topic
            "#,
            schema = self.schema,
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> anyhow::Result<FanoutPolicy> {
                Ok(FanoutPolicy {
                    fanout_topic: row.try_get("fanout_topic")?,
                    cron: row.try_get("cron")?,
                    default_every_seconds: row.try_get("default_every_seconds")?,
                    jitter_seconds: row.try_get("jitter_seconds")?,
                    lease_seconds: row.try_get("lease_seconds")?,
                    work_key: row.try_get("work_key")?,
                    max_catchup_windows: row.try_get::<i32, _>("max_catchup_windows")? as u32,
                })
            })
            .collect()
    }

    async fn upsert_policy(&self, policy: FanoutPolicy) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.fanout_policy
                (fanout_topic, cron, default_every_seconds, jitter_seconds,
                 lease_seconds, work_key, max_catchup_windows)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (fanout_topic) DO UPDATE SET
                cron = EXCLUDED.cron,
                default_every_seconds = EXCLUDED.default_every_seconds,
                jitter_seconds = EXCLUDED.jitter_seconds,
                lease_seconds = EXCLUDED.lease_seconds,
                work_key = EXCLUDED.work_key,
                max_catchup_windows = EXCLUDED.max_catchup_windows
            "#,
            schema = self.schema,
        ))
        .bind(&policy.fanout_topic)
        .bind(&policy.cron)
        .bind(policy.default_every_seconds)
        .bind(policy.jitter_seconds)
        .bind(policy.lease_seconds)
        .bind(&policy.work_key)
        .bind(policy.max_catchup_windows as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn shards(&self, fanout_topic: &str) -> anyhow::Result<Vec<String>> {
        let shards = sqlx::query_scalar(&format!(
            "SELECT shard_key FROM {schema}.fanout_cursor WHERE fanout_topic = $1 \
             ORDER BY shard_key",
            schema = self.schema,
        ))
        .bind(fanout_topic)
        .fetch_all(&self.pool)
        .await?;
        Ok(shards)
    }

    async fn register_shard(&self, fanout_topic: &str, shard_key: &str) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.fanout_cursor (fanout_topic, shard_key, last_emitted_window_start)
            VALUES ($1, $2, NULL)
            ON CONFLICT (fanout_topic, shard_key) DO NOTHING
            "#,
            schema = self.schema,
        ))
        .bind(fanout_topic)
        .bind(shard_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cursor(&self, fanout_topic: &str, shard_key: &str) -> anyhow::Result<FanoutCursor> {
        let last: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&format!(
            r#"
            SELECT last_emitted_window_start
            FROM {schema}.fanout_cursor
            WHERE fanout_topic = $1 AND shard_key = $2
            "#,
            schema = self.schema,
        ))
        .bind(fanout_topic)
        .bind(shard_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(FanoutCursor {
            fanout_topic: fanout_topic.to_string(),
            shard_key: shard_key.to_string(),
            last_emitted_window_start: last.flatten(),
        })
    }

    async fn advance_cursor(
        &self,
        fanout_topic: &str,
        shard_key: &str,
        expected_previous: Option<DateTime<Utc>>,
        new_window_start: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {schema}.fanout_cursor
            SET last_emitted_window_start = $4
            WHERE fanout_topic = $1
              AND shard_key = $2
              AND last_emitted_window_start IS NOT DISTINCT FROM $3
            "#,
            schema = self.schema,
        ))
        .bind(fanout_topic)
        .bind(shard_key)
        .bind(expected_previous)
        .bind(new_window_start)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
