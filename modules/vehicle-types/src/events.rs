//! Event contracts written to the outbox by the vehicle type catalog

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{UpdateVehicleTypeRequest, VehicleType};

pub const AGGREGATE_TYPE: &str = "vehicle_type";

pub const EVENT_TYPE_CREATED: &str = "vehicle_type.created";
pub const EVENT_TYPE_UPDATED: &str = "vehicle_type.updated";
pub const EVENT_TYPE_DELETED: &str = "vehicle_type.deleted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleTypeCreatedV1 {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub passenger_capacity: i32,
    pub category: Option<String>,
}

/// `changes` carries only the fields the caller sent; `name` is always the
/// name after the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleTypeUpdatedV1 {
    pub id: Uuid,
    pub name: String,
    pub changes: UpdateVehicleTypeRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleTypeDeletedV1 {
    pub id: Uuid,
}

impl From<&VehicleType> for VehicleTypeCreatedV1 {
    fn from(vt: &VehicleType) -> Self {
        Self {
            id: vt.id,
            name: vt.name.clone(),
            description: vt.description.clone(),
            passenger_capacity: vt.passenger_capacity,
            category: vt.category.clone(),
        }
    }
}
