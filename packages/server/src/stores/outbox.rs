//! PostgreSQL outbox store with saga joins.
//!
//! `enqueue_in_tx` is the transactional path: the insert rides the caller's
//! open transaction so the message commits atomically with the producer's
//! business write. The unique index on `message_id` turns producer retries
//! into `Duplicate` results instead of errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use taskmill::id::{CorrelationId, JoinId, MessageId};
use taskmill::outbox::{
    EnqueueOptions, EnqueueResult, JoinStatus, JoinStore, JoinTransition, OutboxJoin,
    OutboxMessage, OutboxStore,
};
use taskmill::work_item::WorkItem;

use super::work_queue::{delegate_work_queue_to_field, SqlWorkQueue, WorkItemRow};

const MESSAGE_COLUMNS: &str = "id, status, locked_until, owner_token, retry_count, last_error, \
     due_time_utc, created_at, processed_at, message_id, topic, payload, correlation_id, join_id";

pub struct PgOutboxStore {
    queue: SqlWorkQueue,
    schema: String,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            queue: SqlWorkQueue::new(pool, schema, "outbox"),
            schema: schema.to_string(),
        }
    }

    fn pool(&self) -> &PgPool {
        self.queue.pool()
    }

    fn insert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {schema}.outbox (
                id, status, due_time_utc, created_at,
                message_id, topic, payload, correlation_id, join_id
            )
            VALUES ($1, 'pending', COALESCE($2, NOW()), NOW(), $3, $4, $5, $6, $7)
            ON CONFLICT (message_id) DO NOTHING
            RETURNING message_id
            "#,
            schema = self.schema,
        )
    }

    /// Enqueue inside the caller's transaction. The message becomes visible
    /// to dispatchers only when that transaction commits.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> anyhow::Result<EnqueueResult> {
        let message_id = opts.message_id.unwrap_or_default();
        let inserted: Option<Uuid> = sqlx::query_scalar(&self.insert_sql())
            .bind(Uuid::new_v4())
            .bind(opts.due_time)
            .bind(message_id.into_inner())
            .bind(topic)
            .bind(&payload)
            .bind(opts.correlation_id.as_optional())
            .bind(opts.join_id.map(JoinId::into_inner))
            .fetch_optional(&mut **tx)
            .await?;

        Ok(match inserted {
            Some(_) => EnqueueResult::Created(message_id),
            None => EnqueueResult::Duplicate(message_id),
        })
    }

    fn row_to_message(row: &PgRow) -> anyhow::Result<OutboxMessage> {
        let item: WorkItem = WorkItemRow::from_pg_row(row)?;
        Ok(OutboxMessage {
            item,
            message_id: MessageId::from(row.try_get::<Uuid, _>("message_id")?),
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            correlation_id: CorrelationId::from(
                row.try_get::<Option<Uuid>, _>("correlation_id")?,
            ),
            join_id: row
                .try_get::<Option<Uuid>, _>("join_id")?
                .map(JoinId::from),
        })
    }
}

delegate_work_queue_to_field!(PgOutboxStore, queue);

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(
        &self,
        topic: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> anyhow::Result<EnqueueResult> {
        let message_id = opts.message_id.unwrap_or_default();
        let inserted: Option<Uuid> = sqlx::query_scalar(&self.insert_sql())
            .bind(Uuid::new_v4())
            .bind(opts.due_time)
            .bind(message_id.into_inner())
            .bind(topic)
            .bind(&payload)
            .bind(opts.correlation_id.as_optional())
            .bind(opts.join_id.map(JoinId::into_inner))
            .fetch_optional(self.pool())
            .await?;

        Ok(match inserted {
            Some(_) => EnqueueResult::Created(message_id),
            None => EnqueueResult::Duplicate(message_id),
        })
    }

    async fn load(&self, ids: &[Uuid]) -> anyhow::Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM {schema}.outbox WHERE id = ANY($1) \
             ORDER BY due_time_utc, created_at, id",
            schema = self.schema,
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn get(&self, message_id: MessageId) -> anyhow::Result<Option<OutboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM {schema}.outbox WHERE message_id = $1",
            schema = self.schema,
        ))
        .bind(message_id.into_inner())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn sweep_dispatched(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {schema}.outbox WHERE status = 'completed' AND processed_at < $1",
            schema = self.schema,
        ))
        .bind(older_than)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JoinStore for PgOutboxStore {
    async fn start_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: serde_json::Value,
    ) -> anyhow::Result<JoinId> {
        anyhow::ensure!(expected_steps > 0, "expected_steps must be positive");
        let join_id = JoinId::new();
        sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.outbox_join
                (join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                 status, metadata, created_at)
            VALUES ($1, $2, $3, 0, 0, 'open', $4, NOW())
            "#,
            schema = self.schema,
        ))
        .bind(join_id.into_inner())
        .bind(tenant_id)
        .bind(expected_steps)
        .bind(&metadata)
        .execute(self.pool())
        .await?;
        Ok(join_id)
    }

    async fn attach_message(&self, join_id: JoinId, message_id: MessageId) -> anyhow::Result<()> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.outbox_join_member (join_id, outbox_message_id, step_status)
            SELECT join_id, $2, 'attached'
            FROM {schema}.outbox_join
            WHERE join_id = $1 AND status = 'open'
            "#,
            schema = self.schema,
        ))
        .bind(join_id.into_inner())
        .bind(message_id.into_inner())
        .execute(self.pool())
        .await?;
        anyhow::ensure!(
            result.rows_affected() == 1,
            "join {join_id} is unknown or terminal"
        );
        Ok(())
    }

    async fn report_step(
        &self,
        join_id: JoinId,
        message_id: MessageId,
        completed: bool,
    ) -> anyhow::Result<JoinTransition> {
        let mut tx = self.pool().begin().await?;

        let member = sqlx::query(&format!(
            r#"
            UPDATE {schema}.outbox_join_member
            SET step_status = $3
            WHERE join_id = $1 AND outbox_message_id = $2 AND step_status = 'attached'
            "#,
            schema = self.schema,
        ))
        .bind(join_id.into_inner())
        .bind(message_id.into_inner())
        .bind(if completed { "completed" } else { "failed" })
        .execute(&mut *tx)
        .await?;
        anyhow::ensure!(
            member.rows_affected() == 1,
            "message {message_id} is not an unreported member of join {join_id}"
        );

        let row = sqlx::query(&format!(
            r#"
            UPDATE {schema}.outbox_join
            SET completed_steps = completed_steps + $2,
                failed_steps = failed_steps + $3,
                status = CASE
                    WHEN completed_steps + failed_steps + 1 >= expected_steps THEN
                        CASE WHEN failed_steps + $3 > 0 THEN 'failed' ELSE 'completed' END
                    ELSE 'open'
                END
            WHERE join_id = $1 AND status = 'open'
            RETURNING status, metadata
            "#,
            schema = self.schema,
        ))
        .bind(join_id.into_inner())
        .bind(if completed { 1i32 } else { 0i32 })
        .bind(if completed { 0i32 } else { 1i32 })
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow::anyhow!("join {join_id} is already terminal"))?;

        tx.commit().await?;

        let status: String = row.try_get("status")?;
        Ok(match status.as_str() {
            "open" => JoinTransition::StillOpen,
            "completed" => JoinTransition::Closed {
                status: JoinStatus::Completed,
                metadata: row.try_get("metadata")?,
            },
            "failed" => JoinTransition::Closed {
                status: JoinStatus::Failed,
                metadata: row.try_get("metadata")?,
            },
            other => anyhow::bail!("unknown join status {other:?}"),
        })
    }

    async fn get_join(&self, join_id: JoinId) -> anyhow::Result<Option<OutboxJoin>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT join_id, tenant_id, expected_steps, completed_steps, failed_steps,
                   status, metadata, created_at
            FROM {schema}.outbox_join
            WHERE join_id = $1
            "#,
            schema = self.schema,
        ))
        .bind(join_id.into_inner())
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| -> anyhow::Result<OutboxJoin> {
            let status: String = row.try_get("status")?;
            Ok(OutboxJoin {
                join_id: JoinId::from(row.try_get::<Uuid, _>("join_id")?),
                tenant_id: row.try_get("tenant_id")?,
                expected_steps: row.try_get("expected_steps")?,
                completed_steps: row.try_get("completed_steps")?,
                failed_steps: row.try_get("failed_steps")?,
                status: match status.as_str() {
                    "open" => JoinStatus::Open,
                    "completed" => JoinStatus::Completed,
                    "failed" => JoinStatus::Failed,
                    other => anyhow::bail!("unknown join status {other:?}"),
                },
                metadata: row.try_get("metadata")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }
}
