//! PostgreSQL inbox store.
//!
//! Ingest is a single upsert on the `(source, message_id)` dedupe key:
//! first sight inserts a pending row, a duplicate only refreshes
//! `last_seen_utc`. `first_seen_utc = last_seen_utc` in the returned row
//! distinguishes the two without a second round trip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use taskmill::inbox::{DedupeKey, InboxRecord, InboxStore, IngestResult, NewInboxEvent};
use taskmill::work_item::WorkItem;

use super::work_queue::{delegate_work_queue_to_field, SqlWorkQueue, WorkItemRow};

const RECORD_COLUMNS: &str = "id, status, locked_until, owner_token, retry_count, last_error, \
     due_time_utc, created_at, processed_at, source, message_id, event_type, hash, payload, \
     headers, first_seen_utc, last_seen_utc, processed_utc, attempts";

pub struct PgInboxStore {
    queue: SqlWorkQueue,
    schema: String,
}

impl PgInboxStore {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            queue: SqlWorkQueue::new(pool, schema, "inbox"),
            schema: schema.to_string(),
        }
    }

    fn pool(&self) -> &PgPool {
        self.queue.pool()
    }

    fn row_to_record(row: &PgRow) -> anyhow::Result<InboxRecord> {
        let item: WorkItem = WorkItemRow::from_pg_row(row)?;
        Ok(InboxRecord {
            item,
            source: row.try_get("source")?,
            message_id: row.try_get("message_id")?,
            event_type: row.try_get("event_type")?,
            hash: row.try_get("hash")?,
            payload: row.try_get("payload")?,
            headers: row.try_get("headers")?,
            first_seen_utc: row.try_get("first_seen_utc")?,
            last_seen_utc: row.try_get("last_seen_utc")?,
            processed_utc: row.try_get("processed_utc")?,
            attempts: row.try_get("attempts")?,
        })
    }
}

delegate_work_queue_to_field!(PgInboxStore, queue);

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn ingest(&self, event: NewInboxEvent) -> anyhow::Result<IngestResult> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {schema}.inbox (
                id, status, due_time_utc, created_at,
                source, message_id, event_type, hash, payload, headers,
                first_seen_utc, last_seen_utc, attempts
            )
            VALUES ($1, 'pending', NOW(), NOW(), $2, $3, $4, $5, $6, $7, NOW(), NOW(), 0)
            ON CONFLICT (source, message_id)
                DO UPDATE SET last_seen_utc = NOW()
            RETURNING id, (first_seen_utc = last_seen_utc) AS inserted
            "#,
            schema = self.schema,
        ))
        .bind(Uuid::new_v4())
        .bind(&event.dedupe_key.source)
        .bind(&event.dedupe_key.message_id)
        .bind(&event.event_type)
        .bind(&event.body_hash)
        .bind(&event.payload)
        .bind(&event.headers)
        .fetch_one(self.pool())
        .await?;

        let id: Uuid = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            IngestResult::Stored(id)
        } else {
            IngestResult::DuplicateSeen(id)
        })
    }

    async fn load(&self, ids: &[Uuid]) -> anyhow::Result<Vec<InboxRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {schema}.inbox WHERE id = ANY($1) \
             ORDER BY due_time_utc, created_at, id",
            schema = self.schema,
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn get_by_key(&self, key: &DedupeKey) -> anyhow::Result<Option<InboxRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM {schema}.inbox WHERE source = $1 AND message_id = $2",
            schema = self.schema,
        ))
        .bind(&key.source)
        .bind(&key.message_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn stuck_count(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            r#"
            SELECT COUNT(*)
            FROM {schema}.inbox
            WHERE status NOT IN ('completed', 'poisoned')
              AND first_seen_utc < $1
            "#,
            schema = self.schema,
        ))
        .bind(older_than)
        .fetch_one(self.pool())
        .await?;
        Ok(count as u64)
    }
}
