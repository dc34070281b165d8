//! Shared work-queue SQL over one table.
//!
//! The outbox, inbox, and job-run tables all carry the same work-item
//! columns; this type implements the claim/ack/abandon/fail/reap state
//! machine once and is embedded by each table's store. Claim selects
//! eligible rows in due-time order under `FOR UPDATE SKIP LOCKED`, so
//! concurrent claimants never receive the same row, then flips them to
//! `claimed` in the same statement.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use taskmill::id::OwnerToken;
use taskmill::work_item::{WorkItem, WorkItemStatus, WorkQueue};

/// Work-item columns shared by every queue table.
pub const WORK_ITEM_COLUMNS: &str = "id, status, locked_until, owner_token, retry_count, \
     last_error, due_time_utc, created_at, processed_at";

pub fn status_to_sql(status: WorkItemStatus) -> &'static str {
    match status {
        WorkItemStatus::Pending => "pending",
        WorkItemStatus::Claimed => "claimed",
        WorkItemStatus::Completed => "completed",
        WorkItemStatus::FailedRetryable => "failed_retryable",
        WorkItemStatus::Poisoned => "poisoned",
    }
}

pub fn status_from_sql(raw: &str) -> anyhow::Result<WorkItemStatus> {
    Ok(match raw {
        "pending" => WorkItemStatus::Pending,
        "claimed" => WorkItemStatus::Claimed,
        "completed" => WorkItemStatus::Completed,
        "failed_retryable" => WorkItemStatus::FailedRetryable,
        "poisoned" => WorkItemStatus::Poisoned,
        other => anyhow::bail!("unknown work item status {other:?}"),
    })
}

/// Row shape for the shared columns; converted to the engine's `WorkItem`.
#[derive(Debug, FromRow)]
pub struct WorkItemRow {
    pub id: Uuid,
    pub status: String,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<Uuid>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub due_time_utc: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WorkItemRow {
    pub fn into_work_item(self) -> anyhow::Result<WorkItem> {
        Ok(WorkItem {
            id: self.id,
            status: status_from_sql(&self.status)?,
            locked_until: self.locked_until,
            owner_token: self.owner_token.map(OwnerToken::from),
            retry_count: self.retry_count,
            last_error: self.last_error,
            due_time_utc: self.due_time_utc,
            created_at: self.created_at,
            processed_at: self.processed_at,
        })
    }

    pub fn from_pg_row(row: &PgRow) -> anyhow::Result<WorkItem> {
        WorkItemRow::from_row(row)
            .map_err(anyhow::Error::from)
            .and_then(WorkItemRow::into_work_item)
    }
}

/// The shared state machine bound to one `schema.table`.
#[derive(Clone)]
pub struct SqlWorkQueue {
    pool: PgPool,
    table: String,
}

impl SqlWorkQueue {
    /// `table` must be a trusted identifier (schema-qualified); it is
    /// interpolated, not bound.
    pub fn new(pool: PgPool, schema: &str, table: &str) -> Self {
        Self {
            pool,
            table: format!("{schema}.{table}"),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl WorkQueue for SqlWorkQueue {
    async fn claim(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> anyhow::Result<Vec<WorkItem>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH eligible AS (
                SELECT id
                FROM {table}
                WHERE status IN ('pending', 'failed_retryable')
                  AND due_time_utc <= NOW()
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY due_time_utc, created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} t
            SET status = 'claimed',
                owner_token = $2,
                locked_until = NOW() + make_interval(secs => $3)
            FROM eligible
            WHERE t.id = eligible.id
            RETURNING {columns}
            "#,
            table = self.table,
            columns = columns_qualified("t"),
        ))
        .bind(batch_size as i64)
        .bind(owner.into_inner())
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut items: Vec<WorkItem> = rows
            .iter()
            .map(WorkItemRow::from_pg_row)
            .collect::<anyhow::Result<_>>()?;
        // RETURNING order is not the CTE order; restore the claim order.
        items.sort_by(|a, b| {
            (a.due_time_utc, a.created_at, a.id).cmp(&(b.due_time_utc, b.created_at, b.id))
        });
        Ok(items)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'completed',
                processed_at = NOW(),
                locked_until = NULL,
                owner_token = NULL
            WHERE id = ANY($1)
              AND status = 'claimed'
              AND owner_token = $2
              AND locked_until > NOW()
            "#,
            table = self.table,
        ))
        .bind(ids)
        .bind(owner.into_inner())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        delay: Duration,
    ) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'failed_retryable',
                retry_count = retry_count + 1,
                last_error = COALESCE($4, last_error),
                due_time_utc = NOW() + make_interval(secs => $3),
                locked_until = NULL,
                owner_token = NULL
            WHERE id = ANY($1)
              AND status = 'claimed'
              AND owner_token = $2
              AND locked_until > NOW()
            "#,
            table = self.table,
        ))
        .bind(ids)
        .bind(owner.into_inner())
        .bind(delay.as_secs_f64())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, owner: OwnerToken, ids: &[Uuid], error: &str) -> anyhow::Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'poisoned',
                last_error = $3,
                locked_until = NULL,
                owner_token = NULL
            WHERE id = ANY($1)
              AND status = 'claimed'
              AND owner_token = $2
              AND locked_until > NOW()
            "#,
            table = self.table,
        ))
        .bind(ids)
        .bind(owner.into_inner())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_expired(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'failed_retryable',
                locked_until = NULL,
                owner_token = NULL
            WHERE status = 'claimed'
              AND locked_until < NOW()
            "#,
            table = self.table,
        ))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reschedule(
        &self,
        owner: OwnerToken,
        id: Uuid,
        delay: Duration,
        last_error: &str,
    ) -> anyhow::Result<()> {
        self.abandon(owner, &[id], Some(last_error), delay).await
    }

    async fn replay_poisoned(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'pending',
                retry_count = 0,
                last_error = NULL
            WHERE id = $1
              AND status = 'poisoned'
            "#,
            table = self.table,
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Forward the `WorkQueue` contract to an embedded [`SqlWorkQueue`] field.
macro_rules! delegate_work_queue_to_field {
    ($type:ty, $field:ident) => {
        #[async_trait::async_trait]
        impl taskmill::work_item::WorkQueue for $type {
            async fn claim(
                &self,
                owner: taskmill::id::OwnerToken,
                lease: std::time::Duration,
                batch_size: usize,
            ) -> anyhow::Result<Vec<taskmill::work_item::WorkItem>> {
                taskmill::work_item::WorkQueue::claim(&self.$field, owner, lease, batch_size).await
            }

            async fn ack(
                &self,
                owner: taskmill::id::OwnerToken,
                ids: &[uuid::Uuid],
            ) -> anyhow::Result<()> {
                taskmill::work_item::WorkQueue::ack(&self.$field, owner, ids).await
            }

            async fn abandon(
                &self,
                owner: taskmill::id::OwnerToken,
                ids: &[uuid::Uuid],
                last_error: Option<&str>,
                delay: std::time::Duration,
            ) -> anyhow::Result<()> {
                taskmill::work_item::WorkQueue::abandon(&self.$field, owner, ids, last_error, delay)
                    .await
            }

            async fn fail(
                &self,
                owner: taskmill::id::OwnerToken,
                ids: &[uuid::Uuid],
                error: &str,
            ) -> anyhow::Result<()> {
                taskmill::work_item::WorkQueue::fail(&self.$field, owner, ids, error).await
            }

            async fn reap_expired(&self) -> anyhow::Result<u64> {
                taskmill::work_item::WorkQueue::reap_expired(&self.$field).await
            }

            async fn reschedule(
                &self,
                owner: taskmill::id::OwnerToken,
                id: uuid::Uuid,
                delay: std::time::Duration,
                last_error: &str,
            ) -> anyhow::Result<()> {
                taskmill::work_item::WorkQueue::reschedule(&self.$field, owner, id, delay, last_error)
                    .await
            }

            async fn replay_poisoned(&self, id: uuid::Uuid) -> anyhow::Result<bool> {
                taskmill::work_item::WorkQueue::replay_poisoned(&self.$field, id).await
            }
        }
    };
}

pub(crate) use delegate_work_queue_to_field;

fn columns_qualified(alias: &str) -> String {
    WORK_ITEM_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_roundtrips() {
        for status in [
            WorkItemStatus::Pending,
            WorkItemStatus::Claimed,
            WorkItemStatus::Completed,
            WorkItemStatus::FailedRetryable,
            WorkItemStatus::Poisoned,
        ] {
            assert_eq!(status_from_sql(status_to_sql(status)).unwrap(), status);
        }
        assert!(status_from_sql("running").is_err());
    }

    #[test]
    fn qualified_columns_carry_the_alias() {
        let qualified = columns_qualified("t");
        assert!(qualified.starts_with("t.id, t.status"));
        assert!(qualified.ends_with("t.processed_at"));
    }
}
