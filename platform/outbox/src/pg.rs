//! Postgres-backed outbox ledger (`events_outbox`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::OutboxResult;
use crate::ledger::{OutboxStore, OutboxTx};
use crate::models::{OutboxEvent, OutboxStatus, StatusCounts};

const SELECT_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, \
     created_at, published_at, retry_count, error_message";

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    retry_count: i32,
    error_message: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = crate::OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            created_at: row.created_at,
            published_at: row.published_at,
            retry_count: row.retry_count,
            error_message: row.error_message,
        })
    }
}

fn into_events(rows: Vec<OutboxRow>) -> OutboxResult<Vec<OutboxEvent>> {
    rows.into_iter().map(OutboxEvent::try_from).collect()
}

#[async_trait]
impl<'c> OutboxTx for Transaction<'c, Postgres> {
    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO events_outbox
                (id, aggregate_type, aggregate_id, event_type, payload, status, created_at, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(OutboxStatus::Pending.as_str())
        .bind(event.created_at)
        .execute(&mut **self)
        .await?;

        Ok(())
    }
}

/// Publisher-side view of `events_outbox`
///
/// Rows created in the same transaction share a timestamp resolution, so every
/// ordered read breaks ties on the insertion sequence column.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_status(&self, status: OutboxStatus, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events_outbox \
             WHERE status = $1 ORDER BY created_at ASC, seq ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        into_events(rows)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        self.fetch_by_status(OutboxStatus::Pending, limit).await
    }

    async fn fetch_pending_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events_outbox \
             WHERE status = $1 AND aggregate_type = $2 AND aggregate_id = $3 \
             ORDER BY created_at ASC, seq ASC LIMIT $4"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(OutboxStatus::Pending.as_str())
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        into_events(rows)
    }

    async fn fetch_failed(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        self.fetch_by_status(OutboxStatus::Failed, limit).await
    }

    async fn fetch_retrying_aggregates(&self, max_retries: i32) -> OutboxResult<Vec<(String, String)>> {
        let aggregates = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT DISTINCT aggregate_type, aggregate_id
            FROM events_outbox
            WHERE status = $1 AND retry_count < $2
            "#,
        )
        .bind(OutboxStatus::Failed.as_str())
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        Ok(aggregates)
    }

    async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEvent>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM events_outbox WHERE id = $1");
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OutboxEvent::try_from).transpose()
    }

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET status = $2, published_at = $3, error_message = NULL
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::Published.as_str())
        .bind(published_at)
        .bind(OutboxStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET status = $2, retry_count = retry_count + 1, error_message = $3
            WHERE id = $1 AND status = $4
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::Failed.as_str())
        .bind(error)
        .bind(OutboxStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_to_pending(&self, id: Uuid) -> OutboxResult<bool> {
        let result = sqlx::query("UPDATE events_outbox SET status = $2 WHERE id = $1 AND status = $3")
            .bind(id)
            .bind(OutboxStatus::Pending.as_str())
            .bind(OutboxStatus::Failed.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self) -> OutboxResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM events_outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, count);
        }
        Ok(counts)
    }

    async fn fetch_unforwarded(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events_outbox \
             WHERE forwarded_at IS NULL ORDER BY created_at ASC, seq ASC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        into_events(rows)
    }

    async fn mark_forwarded(&self, id: Uuid, forwarded_at: DateTime<Utc>) -> OutboxResult<bool> {
        let result = sqlx::query(
            "UPDATE events_outbox SET forwarded_at = $2 WHERE id = $1 AND forwarded_at IS NULL",
        )
        .bind(id)
        .bind(forwarded_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
