//! # Event Envelope
//!
//! Wire format for every event an outbox publisher puts on the bus.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Outbox row id; consumers use it as their idempotency key
//! - `event_type`: Dotted event name (e.g. `vehicle_type.updated`)
//! - `aggregate_type` / `aggregate_id`: The aggregate whose mutation produced the event
//! - `occurred_at`: Creation time of the outbox row
//! - `source_module` / `source_version`: Producing service
//! - `payload`: Event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard event envelope for outbox traffic
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     "vehicle_type.created",
///     "VehicleType",
///     "4f1c2c9e-0000-4000-8000-000000000001",
///     json!({"name": "Bus"}),
/// )
/// .with_source("vehicle-types", "1.0.0");
///
/// assert_eq!(envelope.source_module, "vehicle-types");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source_module: String,
    pub source_version: String,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with a fresh `event_id` and `occurred_at = now`.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: T,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Utc::now(),
            source_module: "unknown".to_string(),
            source_version: "0.0.0".to_string(),
            payload,
        }
    }

    /// Keep an existing identity (the outbox row id) instead of a fresh one.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_source(mut self, module: impl Into<String>, version: impl Into<String>) -> Self {
        self.source_module = module.into();
        self.source_version = version.into();
        self
    }
}

/// Validate the envelope header fields of a raw JSON message.
///
/// # Validation Rules
///
/// - `event_id`: present and a valid UUID
/// - `event_type`, `aggregate_type`, `aggregate_id`, `source_module`: non-empty strings
/// - `occurred_at`: present
/// - `payload`: present
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    Uuid::parse_str(event_id).map_err(|e| format!("event_id is not a UUID: {e}"))?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    for field in ["event_type", "aggregate_type", "aggregate_id", "source_module"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;

        if value.is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    if envelope.get("payload").is_none() {
        return Err("Missing payload".to_string());
    }

    Ok(())
}
