//! PostgreSQL leases and fencing locks.
//!
//! The fencing counter lives on the `distributed_lock` row and only ever
//! increments. Release expires the lease instead of deleting the row, so
//! the counter survives and tokens never regress across holders.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use taskmill::id::OwnerToken;
use taskmill::lease::{CoarseLeaseGrant, CoarseLeaseStore, FencingToken, LockStore};

pub struct PgLeaseStore {
    pool: PgPool,
    schema: String,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
        }
    }
}

#[async_trait]
impl CoarseLeaseStore for PgLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        duration: Duration,
    ) -> anyhow::Result<CoarseLeaseGrant> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.lease (name, owner, lease_until_utc)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                lease_until_utc = EXCLUDED.lease_until_utc
            WHERE lease.lease_until_utc <= NOW() OR lease.owner = EXCLUDED.owner
            RETURNING NOW() AS server_now, lease_until_utc
            "#,
            schema = self.schema,
        ))
        .bind(name)
        .bind(owner)
        .bind(duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CoarseLeaseGrant {
                acquired: true,
                server_now: row.try_get("server_now")?,
                lease_until: row.try_get("lease_until_utc")?,
            }),
            None => {
                // Held by someone else; report the holder's horizon.
                let row = sqlx::query(&format!(
                    "SELECT NOW() AS server_now, lease_until_utc FROM {schema}.lease WHERE name = $1",
                    schema = self.schema,
                ))
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
                Ok(CoarseLeaseGrant {
                    acquired: false,
                    server_now: row.try_get("server_now")?,
                    lease_until: row.try_get("lease_until_utc")?,
                })
            }
        }
    }

    async fn renew(&self, name: &str, owner: &str, duration: Duration) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {schema}.lease
            SET lease_until_utc = NOW() + make_interval(secs => $3)
            WHERE name = $1 AND owner = $2 AND lease_until_utc > NOW()
            "#,
            schema = self.schema,
        ))
        .bind(name)
        .bind(owner)
        .bind(duration.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &str, owner: &str) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "UPDATE {schema}.lease SET lease_until_utc = NOW() WHERE name = $1 AND owner = $2",
            schema = self.schema,
        ))
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for PgLeaseStore {
    async fn acquire(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
        context: Option<serde_json::Value>,
    ) -> anyhow::Result<Option<FencingToken>> {
        let token: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO {schema}.distributed_lock
                (resource_name, owner_token, fencing_token, lease_until_utc, context_json)
            VALUES ($1, $2, 1, NOW() + make_interval(secs => $3), $4)
            ON CONFLICT (resource_name) DO UPDATE SET
                owner_token = EXCLUDED.owner_token,
                fencing_token = distributed_lock.fencing_token + 1,
                lease_until_utc = EXCLUDED.lease_until_utc,
                context_json = EXCLUDED.context_json
            WHERE distributed_lock.lease_until_utc <= NOW()
               OR distributed_lock.owner_token = EXCLUDED.owner_token
            RETURNING fencing_token
            "#,
            schema = self.schema,
        ))
        .bind(resource)
        .bind(owner.into_inner())
        .bind(duration.as_secs_f64())
        .bind(context)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token.map(FencingToken))
    }

    async fn renew(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
    ) -> anyhow::Result<Option<FencingToken>> {
        let token: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            UPDATE {schema}.distributed_lock
            SET fencing_token = fencing_token + 1,
                lease_until_utc = NOW() + make_interval(secs => $3)
            WHERE resource_name = $1 AND owner_token = $2 AND lease_until_utc > NOW()
            RETURNING fencing_token
            "#,
            schema = self.schema,
        ))
        .bind(resource)
        .bind(owner.into_inner())
        .bind(duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(token.map(FencingToken))
    }

    async fn release(&self, resource: &str, owner: OwnerToken) -> anyhow::Result<()> {
        // Expire, do not delete: the fencing counter must survive release.
        sqlx::query(&format!(
            r#"
            UPDATE {schema}.distributed_lock
            SET lease_until_utc = NOW()
            WHERE resource_name = $1 AND owner_token = $2
            "#,
            schema = self.schema,
        ))
        .bind(resource)
        .bind(owner.into_inner())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
