use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateVehicleRequest, Vehicle};
use crate::repos::{vehicle_repo, vehicle_type_cache_repo};

#[derive(Debug, thiserror::Error)]
pub enum VehicleError {
    #[error("vehicle {0} not found")]
    NotFound(Uuid),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("vehicle type {0} does not exist or is inactive")]
    UnknownVehicleType(Uuid),

    #[error("a vehicle with plate '{0}' already exists")]
    DuplicatePlate(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct VehicleService {
    pool: PgPool,
}

impl VehicleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Vehicle, VehicleError> {
        vehicle_repo::find(&self.pool, id)
            .await?
            .ok_or(VehicleError::NotFound(id))
    }

    /// Register a vehicle of a type this service has seen a created event for
    ///
    /// The cache row stays share-locked until the insert commits, so a delete
    /// being applied at the same time either waits and then deactivates the
    /// new vehicle too, or commits first and the create is refused.
    pub async fn create(&self, req: CreateVehicleRequest) -> Result<Vehicle, VehicleError> {
        req.validate().map_err(VehicleError::Validation)?;

        let mut tx = self.pool.begin().await?;

        let vehicle_type = vehicle_type_cache_repo::find_active_for_share(&mut tx, req.vehicle_type_id)
            .await?
            .ok_or(VehicleError::UnknownVehicleType(req.vehicle_type_id))?;

        let now = Utc::now();
        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            plate: req.plate.trim().to_uppercase(),
            brand: req.brand,
            model: req.model,
            year: req.year,
            color: req.color,
            vehicle_type_id: vehicle_type.id,
            vehicle_type_name: Some(vehicle_type.name),
            serial_number: req.serial_number,
            active: true,
            created_at: now,
            updated_at: now,
        };

        vehicle_repo::insert(&mut tx, &vehicle).await.map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                VehicleError::DuplicatePlate(vehicle.plate.clone())
            }
            _ => VehicleError::Database(e),
        })?;

        tx.commit().await?;

        tracing::info!(vehicle_id = %vehicle.id, vehicle_type_id = %vehicle.vehicle_type_id, "Vehicle created");

        Ok(vehicle)
    }
}
