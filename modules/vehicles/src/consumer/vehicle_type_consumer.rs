//! Vehicle type events → vehicle name cache
//!
//! Subscribes to `{prefix}.vehicle_type.>`. The idempotency marker is written
//! in the same transaction as the cache update, so a redelivered event either
//! finds the marker and does nothing, or finds no trace of a rolled-back
//! attempt and applies cleanly.

use async_trait::async_trait;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{EventBus, EventEnvelope};
use event_consumer::{
    try_mark_processed_tx, EventHandler, GuardStrategy, HandlerError, IdempotentConsumer,
    PgDeadLetterSink, ProcessOutcome,
};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::repos::{vehicle_repo, vehicle_type_cache_repo};

pub const EVENT_TYPE_CREATED: &str = "vehicle_type.created";
pub const EVENT_TYPE_UPDATED: &str = "vehicle_type.updated";
pub const EVENT_TYPE_DELETED: &str = "vehicle_type.deleted";

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct VehicleTypeChanges {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct VehicleTypeNamed {
    id: Uuid,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    changes: Option<VehicleTypeChanges>,
}

impl VehicleTypeNamed {
    /// Current name: the full name when sent, else the changed name
    fn current_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.changes.as_ref().and_then(|c| c.name.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct VehicleTypeDeleted {
    id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
enum CacheAction {
    Upsert { id: Uuid, name: String },
    Rename { id: Uuid, name: String },
    Deactivate { id: Uuid },
    /// Event carries nothing this service caches
    Ignore,
}

fn decode(event: &EventEnvelope<Value>) -> Result<CacheAction, HandlerError> {
    match event.event_type.as_str() {
        EVENT_TYPE_CREATED => {
            let p: VehicleTypeNamed = serde_json::from_value(event.payload.clone())?;
            let name = p
                .current_name()
                .ok_or_else(|| HandlerError::Permanent("created event without name".to_string()))?
                .to_string();
            Ok(CacheAction::Upsert { id: p.id, name })
        }
        EVENT_TYPE_UPDATED => {
            let p: VehicleTypeNamed = serde_json::from_value(event.payload.clone())?;
            Ok(match p.current_name() {
                Some(name) => CacheAction::Rename {
                    id: p.id,
                    name: name.to_string(),
                },
                None => CacheAction::Ignore,
            })
        }
        EVENT_TYPE_DELETED => {
            let p: VehicleTypeDeleted = serde_json::from_value(event.payload.clone())?;
            Ok(CacheAction::Deactivate { id: p.id })
        }
        _ => Ok(CacheAction::Ignore),
    }
}

pub struct VehicleTypeEventHandler {
    pool: PgPool,
}

impl VehicleTypeEventHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler for VehicleTypeEventHandler {
    async fn handle(&self, event: &EventEnvelope<Value>) -> Result<ProcessOutcome, HandlerError> {
        let action = decode(event)?;

        let mut tx = self.pool.begin().await?;

        let marked = try_mark_processed_tx(
            &mut tx,
            &event.event_id.to_string(),
            &event.event_type,
            &event.payload,
        )
        .await?;
        if marked.already_processed {
            tx.rollback().await?;
            return Ok(ProcessOutcome::Duplicate);
        }

        match &action {
            CacheAction::Upsert { id, name } => {
                vehicle_type_cache_repo::upsert(&mut tx, *id, name).await?;
            }
            CacheAction::Rename { id, name } => {
                vehicle_type_cache_repo::upsert(&mut tx, *id, name).await?;
                let renamed = vehicle_repo::rename_vehicle_type(&mut tx, *id, name).await?;
                tracing::info!(
                    event_id = %event.event_id,
                    vehicle_type_id = %id,
                    vehicles = renamed,
                    "Vehicle type name cache refreshed"
                );
            }
            CacheAction::Deactivate { id } => {
                vehicle_type_cache_repo::deactivate(&mut tx, *id).await?;
                let deactivated = vehicle_repo::deactivate_by_vehicle_type(&mut tx, *id).await?;
                tracing::warn!(
                    event_id = %event.event_id,
                    vehicle_type_id = %id,
                    vehicles = deactivated,
                    "Vehicles deactivated after their type was deleted"
                );
            }
            CacheAction::Ignore => {
                tracing::debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Event has no effect on vehicles"
                );
            }
        }

        tx.commit().await?;
        Ok(ProcessOutcome::Applied)
    }
}

/// Build the guarded consumer for vehicle type events
pub fn vehicle_type_consumer(pool: PgPool, retry: RetryConfig) -> IdempotentConsumer {
    IdempotentConsumer::new(
        "vehicles.vehicle_type",
        Arc::new(VehicleTypeEventHandler::new(pool.clone())),
        GuardStrategy::Transactional,
        Arc::new(PgDeadLetterSink::new(pool)),
    )
    .with_retry(retry)
}

/// Spawn the consumer loop on `subject` until `shutdown` flips
pub fn start_vehicle_type_consumer(
    bus: Arc<dyn EventBus>,
    pool: PgPool,
    subject: String,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let consumer = Arc::new(vehicle_type_consumer(pool, retry));
    tokio::spawn(async move {
        if let Err(e) = consumer.run(bus, &subject, shutdown).await {
            tracing::error!(subject = %subject, error = %e, "Vehicle type consumer stopped with error");
        }
    })
}
