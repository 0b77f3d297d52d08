//! Consumer dead-letter queue (`failed_events`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ConsumerResult;

/// A message the consumer gave up on
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DeadLetter {
    /// `None` when the envelope could not be parsed
    pub event_id: Option<Uuid>,
    pub subject: String,
    /// Raw message body (lossy UTF-8)
    pub payload: String,
    pub error: String,
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record the failure. Upserts on `event_id` when one is known.
    async fn dead_letter(&self, letter: DeadLetter) -> ConsumerResult<()>;
}

#[derive(Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, limit: i64) -> ConsumerResult<Vec<DeadLetter>> {
        let letters = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT event_id, subject, payload, error, retry_count, failed_at
            FROM failed_events
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(letters)
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) -> ConsumerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_events (id, event_id, subject, payload, error, retry_count, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO UPDATE
            SET error = EXCLUDED.error,
                retry_count = EXCLUDED.retry_count,
                failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(letter.event_id)
        .bind(&letter.subject)
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(letter.retry_count)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) -> ConsumerResult<()> {
        let mut letters = self.letters.lock().await;
        let existing = letter
            .event_id
            .and_then(|id| letters.iter().position(|l| l.event_id == Some(id)));

        match existing {
            Some(index) => {
                let slot = &mut letters[index];
                slot.error = letter.error;
                slot.retry_count = letter.retry_count;
                slot.failed_at = letter.failed_at;
            }
            None => letters.push(letter),
        }
        Ok(())
    }
}
