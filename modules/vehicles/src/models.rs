use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vehicle {
    pub id: Uuid,
    pub plate: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub vehicle_type_id: Uuid,
    /// Denormalized from the vehicle type service; kept current by events
    pub vehicle_type_name: Option<String>,
    pub serial_number: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVehicleRequest {
    pub plate: String,
    pub brand: String,
    pub model: String,
    pub year: i32,
    pub color: String,
    pub vehicle_type_id: Uuid,
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl CreateVehicleRequest {
    pub fn validate(&self) -> Result<(), String> {
        let plate = self.plate.trim();
        if plate.is_empty() || plate.chars().count() > 20 {
            return Err("plate must be 1-20 characters".to_string());
        }
        for (field, value) in [("brand", &self.brand), ("model", &self.model), ("color", &self.color)] {
            if value.trim().is_empty() {
                return Err(format!("{field} must not be empty"));
            }
        }
        if !(1886..=2100).contains(&self.year) {
            return Err("year is out of range".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_validation() {
        let mut req = CreateVehicleRequest {
            plate: "ABC-123".to_string(),
            brand: "Volvo".to_string(),
            model: "B8R".to_string(),
            year: 2022,
            color: "white".to_string(),
            vehicle_type_id: Uuid::new_v4(),
            serial_number: None,
        };
        assert!(req.validate().is_ok());

        req.color = " ".to_string();
        assert_eq!(req.validate().unwrap_err(), "color must not be empty");

        req.color = "white".to_string();
        req.year = 1500;
        assert!(req.validate().is_err());
    }
}
