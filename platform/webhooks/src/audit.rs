//! Delivery audit log: `webhook_events` and `webhook_deliveries`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::WebhookResult;
use crate::payload::WebhookPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "success" {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failed
        }
    }
}

/// One attempt to deliver one event to one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub attempt_number: i32,
    pub status: DeliveryStatus,
    pub response_status: Option<i32>,
    pub response_body_excerpt: Option<String>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An event the notifier was asked to deliver, keyed by idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_type: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEventRecord {
    pub fn from_payload(payload: &WebhookPayload) -> WebhookResult<Self> {
        Ok(Self {
            id: payload.id,
            event_type: payload.event.clone(),
            idempotency_key: payload.idempotency_key.clone(),
            payload: serde_json::to_value(payload)?,
            received_at: Utc::now(),
        })
    }
}

/// Append-only record of deliveries
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Store the event. A repeated idempotency key replaces the stored payload.
    async fn record_event(&self, record: &WebhookEventRecord) -> WebhookResult<()>;

    async fn append(&self, delivery: &WebhookDelivery) -> WebhookResult<()>;

    async fn deliveries_for_event(&self, event_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>>;

    async fn deliveries_for_subscription(&self, subscription_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>>;
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    event_id: Uuid,
    subscription_id: Uuid,
    attempt_number: i32,
    status: String,
    response_status: Option<i32>,
    response_body_excerpt: Option<String>,
    error_message: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<DeliveryRow> for WebhookDelivery {
    fn from(row: DeliveryRow) -> Self {
        Self {
            id: row.id,
            event_id: row.event_id,
            subscription_id: row.subscription_id,
            attempt_number: row.attempt_number,
            status: DeliveryStatus::parse(&row.status),
            response_status: row.response_status,
            response_body_excerpt: row.response_body_excerpt,
            error_message: row.error_message,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgDeliveryLog {
    pool: PgPool,
}

impl PgDeliveryLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn deliveries_where(&self, column: &str, id: Uuid) -> WebhookResult<Vec<WebhookDelivery>> {
        let sql = format!(
            "SELECT id, event_id, subscription_id, attempt_number, status, response_status, \
             response_body_excerpt, error_message, delivered_at, created_at \
             FROM webhook_deliveries WHERE {column} = $1 ORDER BY created_at ASC, attempt_number ASC"
        );
        let rows = sqlx::query_as::<_, DeliveryRow>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(WebhookDelivery::from).collect())
    }
}

#[async_trait]
impl DeliveryLog for PgDeliveryLog {
    async fn record_event(&self, record: &WebhookEventRecord) -> WebhookResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, event_type, idempotency_key, payload, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET payload = EXCLUDED.payload,
                event_type = EXCLUDED.event_type,
                received_at = EXCLUDED.received_at
            "#,
        )
        .bind(record.id)
        .bind(&record.event_type)
        .bind(&record.idempotency_key)
        .bind(&record.payload)
        .bind(record.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append(&self, delivery: &WebhookDelivery) -> WebhookResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, event_id, subscription_id, attempt_number, status, response_status,
                 response_body_excerpt, error_message, delivered_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.event_id)
        .bind(delivery.subscription_id)
        .bind(delivery.attempt_number)
        .bind(delivery.status.as_str())
        .bind(delivery.response_status)
        .bind(&delivery.response_body_excerpt)
        .bind(&delivery.error_message)
        .bind(delivery.delivered_at)
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deliveries_for_event(&self, event_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>> {
        self.deliveries_where("event_id", event_id).await
    }

    async fn deliveries_for_subscription(&self, subscription_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>> {
        self.deliveries_where("subscription_id", subscription_id).await
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeliveryLog {
    events: Arc<Mutex<Vec<WebhookEventRecord>>>,
    deliveries: Arc<Mutex<Vec<WebhookDelivery>>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<WebhookEventRecord> {
        self.events.lock().await.clone()
    }

    pub async fn deliveries(&self) -> Vec<WebhookDelivery> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryLog for InMemoryDeliveryLog {
    async fn record_event(&self, record: &WebhookEventRecord) -> WebhookResult<()> {
        let mut events = self.events.lock().await;
        match events
            .iter_mut()
            .find(|e| e.idempotency_key == record.idempotency_key)
        {
            Some(existing) => {
                existing.event_type = record.event_type.clone();
                existing.payload = record.payload.clone();
                existing.received_at = record.received_at;
            }
            None => events.push(record.clone()),
        }
        Ok(())
    }

    async fn append(&self, delivery: &WebhookDelivery) -> WebhookResult<()> {
        self.deliveries.lock().await.push(delivery.clone());
        Ok(())
    }

    async fn deliveries_for_event(&self, event_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .lock()
            .await
            .iter()
            .filter(|d| d.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn deliveries_for_subscription(&self, subscription_id: Uuid) -> WebhookResult<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .lock()
            .await
            .iter()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}
