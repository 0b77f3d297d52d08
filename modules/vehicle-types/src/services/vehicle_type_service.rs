//! Vehicle type mutations
//!
//! Each mutation writes the aggregate and its outbox event in one transaction,
//! then signals the committed event id so the publisher wakes up. The signal
//! is best-effort; the publisher's sweep covers anything it misses.

use chrono::Utc;
use outbox::{notify_committed, record_serialized_event, ChangeChannel, OutboxError};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::events::{
    VehicleTypeCreatedV1, VehicleTypeDeletedV1, VehicleTypeUpdatedV1, AGGREGATE_TYPE,
    EVENT_TYPE_CREATED, EVENT_TYPE_DELETED, EVENT_TYPE_UPDATED,
};
use crate::models::{CreateVehicleTypeRequest, UpdateVehicleTypeRequest, VehicleType};
use crate::repos::vehicle_type_repo;

#[derive(Debug, thiserror::Error)]
pub enum VehicleTypeError {
    #[error("vehicle type {0} not found")]
    NotFound(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("a vehicle type named '{0}' already exists")]
    DuplicateName(String),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_unique_violation(e: sqlx::Error, name: &str) -> VehicleTypeError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            VehicleTypeError::DuplicateName(name.to_string())
        }
        _ => VehicleTypeError::Database(e),
    }
}

pub struct VehicleTypeService {
    pool: PgPool,
    channel: Arc<dyn ChangeChannel>,
}

impl VehicleTypeService {
    pub fn new(pool: PgPool, channel: Arc<dyn ChangeChannel>) -> Self {
        Self { pool, channel }
    }

    pub async fn get(&self, id: Uuid) -> Result<VehicleType, VehicleTypeError> {
        vehicle_type_repo::find_active(&self.pool, id)
            .await?
            .ok_or(VehicleTypeError::NotFound(id))
    }

    pub async fn create(&self, req: CreateVehicleTypeRequest) -> Result<VehicleType, VehicleTypeError> {
        req.validate().map_err(VehicleTypeError::Validation)?;

        let now = Utc::now();
        let vehicle_type = VehicleType {
            id: Uuid::new_v4(),
            name: req.name.trim().to_string(),
            description: req.description,
            passenger_capacity: req.passenger_capacity,
            category: req.category,
            active: true,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;

        vehicle_type_repo::insert(&mut tx, &vehicle_type)
            .await
            .map_err(|e| map_unique_violation(e, &vehicle_type.name))?;

        let event_id = record_serialized_event(
            &mut tx,
            AGGREGATE_TYPE,
            &vehicle_type.id.to_string(),
            EVENT_TYPE_CREATED,
            &VehicleTypeCreatedV1::from(&vehicle_type),
        )
        .await?;

        tx.commit().await?;
        notify_committed(self.channel.as_ref(), &[event_id]).await;

        tracing::info!(
            vehicle_type_id = %vehicle_type.id,
            event_id = %event_id,
            "Vehicle type created"
        );

        Ok(vehicle_type)
    }

    pub async fn update(
        &self,
        id: Uuid,
        changes: UpdateVehicleTypeRequest,
    ) -> Result<VehicleType, VehicleTypeError> {
        changes.validate().map_err(VehicleTypeError::Validation)?;

        let mut tx = self.pool.begin().await?;

        let mut vehicle_type = vehicle_type_repo::find_active_for_update(&mut tx, id)
            .await?
            .ok_or(VehicleTypeError::NotFound(id))?;

        changes.apply_to(&mut vehicle_type);
        vehicle_type.updated_at = Utc::now();

        vehicle_type_repo::update(&mut tx, &vehicle_type)
            .await
            .map_err(|e| map_unique_violation(e, &vehicle_type.name))?;

        let event_id = record_serialized_event(
            &mut tx,
            AGGREGATE_TYPE,
            &id.to_string(),
            EVENT_TYPE_UPDATED,
            &VehicleTypeUpdatedV1 {
                id,
                name: vehicle_type.name.clone(),
                changes,
            },
        )
        .await?;

        tx.commit().await?;
        notify_committed(self.channel.as_ref(), &[event_id]).await;

        tracing::info!(vehicle_type_id = %id, event_id = %event_id, "Vehicle type updated");

        Ok(vehicle_type)
    }

    /// Soft delete
    pub async fn delete(&self, id: Uuid) -> Result<(), VehicleTypeError> {
        let mut tx = self.pool.begin().await?;

        let mut vehicle_type = vehicle_type_repo::find_active_for_update(&mut tx, id)
            .await?
            .ok_or(VehicleTypeError::NotFound(id))?;

        vehicle_type.active = false;
        vehicle_type.updated_at = Utc::now();
        vehicle_type_repo::update(&mut tx, &vehicle_type).await?;

        let event_id = record_serialized_event(
            &mut tx,
            AGGREGATE_TYPE,
            &id.to_string(),
            EVENT_TYPE_DELETED,
            &VehicleTypeDeletedV1 { id },
        )
        .await?;

        tx.commit().await?;
        notify_committed(self.channel.as_ref(), &[event_id]).await;

        tracing::info!(vehicle_type_id = %id, event_id = %event_id, "Vehicle type deleted");

        Ok(())
    }
}
