//! Idempotency ledger (`processed_events`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::ConsumerResult;

/// Proof that an event was applied. Created once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

/// Result of an atomic mark attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkOutcome {
    pub already_processed: bool,
}

impl MarkOutcome {
    pub const FIRST: MarkOutcome = MarkOutcome { already_processed: false };
    pub const DUPLICATE: MarkOutcome = MarkOutcome { already_processed: true };
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert the marker for `event_id` unless one exists.
    ///
    /// Exactly one concurrent caller per id observes `already_processed == false`.
    async fn try_mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> ConsumerResult<MarkOutcome>;

    async fn get(&self, event_id: &str) -> ConsumerResult<Option<IdempotencyRecord>>;
}

const INSERT_MARKER: &str = r#"
    INSERT INTO processed_events (event_id, event_type, payload, processed_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (event_id) DO NOTHING
"#;

async fn insert_marker<'e, E>(
    executor: E,
    event_id: &str,
    event_type: &str,
    payload: &serde_json::Value,
) -> ConsumerResult<MarkOutcome>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(INSERT_MARKER)
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(Utc::now())
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        tracing::debug!(event_id = %event_id, event_type = %event_type, "Event already processed");
        Ok(MarkOutcome::DUPLICATE)
    } else {
        Ok(MarkOutcome::FIRST)
    }
}

/// Mark inside the caller's transaction
///
/// A rollback also removes the marker, so a failed effect can be redelivered
/// and applied later.
pub async fn try_mark_processed_tx(
    tx: &mut Transaction<'_, Postgres>,
    event_id: &str,
    event_type: &str,
    payload: &serde_json::Value,
) -> ConsumerResult<MarkOutcome> {
    insert_marker(&mut **tx, event_id, event_type, payload).await
}

#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> ConsumerResult<MarkOutcome> {
        insert_marker(&self.pool, event_id, event_type, payload).await
    }

    async fn get(&self, event_id: &str) -> ConsumerResult<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            "SELECT event_id, event_type, payload, processed_at FROM processed_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

/// Map-backed ledger; the lock makes check-and-insert a single step
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_mark_processed(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> ConsumerResult<MarkOutcome> {
        let mut records = self.records.lock().await;
        if records.contains_key(event_id) {
            return Ok(MarkOutcome::DUPLICATE);
        }

        records.insert(
            event_id.to_string(),
            IdempotencyRecord {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
                processed_at: Utc::now(),
            },
        );
        Ok(MarkOutcome::FIRST)
    }

    async fn get(&self, event_id: &str) -> ConsumerResult<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(event_id).cloned())
    }
}
