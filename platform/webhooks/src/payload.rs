use outbox::OutboxEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a webhook came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookMetadata {
    pub source: String,
    pub environment: String,
}

/// Wire body of every outbound webhook
///
/// The JSON produced by [`WebhookPayload::to_bytes`] is exactly what gets
/// signed and sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub version: String,
    pub id: Uuid,
    pub idempotency_key: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub data: serde_json::Value,
    pub metadata: WebhookMetadata,
}

/// `"{event_type}-{aggregate_id}-{event_id}"`
pub fn idempotency_key_for(event_type: &str, aggregate_id: &str, event_id: Uuid) -> String {
    format!("{event_type}-{aggregate_id}-{event_id}")
}

impl WebhookPayload {
    /// Build the webhook body for an outbox row
    ///
    /// `id` and `timestamp` match the event id and occurred-at of the envelope
    /// the publisher puts on the bus for the same row.
    pub fn from_outbox_event(event: &OutboxEvent, version: &str, metadata: WebhookMetadata) -> Self {
        Self {
            event: event.event_type.clone(),
            version: version.to_string(),
            id: event.id,
            idempotency_key: idempotency_key_for(&event.event_type, &event.aggregate_id, event.id),
            timestamp: event.created_at.timestamp_millis(),
            data: event.payload.clone(),
            metadata,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
