use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::models::{OutboxEvent, StatusCounts};

/// A write handle bound to the caller's open business transaction
///
/// Rows inserted through it become visible exactly when that transaction
/// commits and vanish if it rolls back.
#[async_trait]
pub trait OutboxTx: Send {
    async fn insert_outbox_event(&mut self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Record an event inside the caller's transaction.
///
/// Returns the new event id. The caller signals it over a
/// [`ChangeChannel`](crate::ChangeChannel) only after its commit succeeds.
pub async fn record_event<X>(
    tx: &mut X,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    payload: serde_json::Value,
) -> OutboxResult<Uuid>
where
    X: OutboxTx + ?Sized,
{
    if aggregate_type.is_empty() || aggregate_id.is_empty() || event_type.is_empty() {
        return Err(OutboxError::Validation(
            "aggregate_type, aggregate_id and event_type must be non-empty".to_string(),
        ));
    }

    let event = OutboxEvent::pending(aggregate_type, aggregate_id, event_type, payload);
    tx.insert_outbox_event(&event).await?;

    tracing::debug!(
        event_id = %event.id,
        event_type = %event.event_type,
        aggregate_type = %event.aggregate_type,
        aggregate_id = %event.aggregate_id,
        "Event recorded in outbox"
    );

    Ok(event.id)
}

/// [`record_event`] for any serializable payload
pub async fn record_serialized_event<X, T>(
    tx: &mut X,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    payload: &T,
) -> OutboxResult<Uuid>
where
    X: OutboxTx + ?Sized,
    T: Serialize + Sync,
{
    let payload = serde_json::to_value(payload)?;
    record_event(tx, aggregate_type, aggregate_id, event_type, payload).await
}

/// Publisher-side access to the outbox ledger
///
/// Every status transition is conditional on the row's current status, so two
/// publishers racing on the same row cannot both move it.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// PENDING rows, oldest first
    async fn fetch_pending(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// PENDING rows of one aggregate, oldest first
    async fn fetch_pending_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxEvent>>;

    /// FAILED rows, oldest first
    async fn fetch_failed(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// `(aggregate_type, aggregate_id)` of every aggregate holding a FAILED row
    /// with `retry_count` below `max_retries`
    async fn fetch_retrying_aggregates(&self, max_retries: i32) -> OutboxResult<Vec<(String, String)>>;

    async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEvent>>;

    /// PENDING → PUBLISHED. Returns false if the row was not PENDING.
    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> OutboxResult<bool>;

    /// PENDING → FAILED, incrementing `retry_count`. Returns false if the row was not PENDING.
    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<bool>;

    /// FAILED → PENDING. Returns false if the row was not FAILED.
    async fn reset_to_pending(&self, id: Uuid) -> OutboxResult<bool>;

    async fn count_by_status(&self) -> OutboxResult<StatusCounts>;

    /// Rows not yet handed to the webhook forwarder, whatever their status, oldest first
    async fn fetch_unforwarded(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// Record the webhook handoff. Returns false if the row was already handed off.
    async fn mark_forwarded(&self, id: Uuid, forwarded_at: DateTime<Utc>) -> OutboxResult<bool>;
}
