//! Vehicle type aggregate and request DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const NAME_MAX_LEN: usize = 100;
pub const CATEGORY_MAX_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VehicleType {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub passenger_capacity: i32,
    pub category: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVehicleTypeRequest {
    pub name: String,
    pub description: String,
    pub passenger_capacity: i32,
    #[serde(default)]
    pub category: Option<String>,
}

/// Partial update; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateVehicleTypeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passenger_capacity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl CreateVehicleTypeRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)?;
        validate_capacity(self.passenger_capacity)?;
        validate_category(self.category.as_deref())
    }
}

impl UpdateVehicleTypeRequest {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("at least one field must be provided".to_string());
        }
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(capacity) = self.passenger_capacity {
            validate_capacity(capacity)?;
        }
        validate_category(self.category.as_deref())
    }

    /// Copy the provided fields onto `vehicle_type`
    pub fn apply_to(&self, vehicle_type: &mut VehicleType) {
        if let Some(name) = &self.name {
            vehicle_type.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            vehicle_type.description = description.clone();
        }
        if let Some(capacity) = self.passenger_capacity {
            vehicle_type.passenger_capacity = capacity;
        }
        if let Some(category) = &self.category {
            vehicle_type.category = Some(category.clone());
        }
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.chars().count() > NAME_MAX_LEN {
        return Err(format!("name must be at most {NAME_MAX_LEN} characters"));
    }
    Ok(())
}

fn validate_capacity(capacity: i32) -> Result<(), String> {
    if capacity <= 0 {
        return Err("passenger_capacity must be positive".to_string());
    }
    Ok(())
}

fn validate_category(category: Option<&str>) -> Result<(), String> {
    match category {
        Some(c) if c.chars().count() > CATEGORY_MAX_LEN => {
            Err(format!("category must be at most {CATEGORY_MAX_LEN} characters"))
        }
        _ => Ok(()),
    }
}
