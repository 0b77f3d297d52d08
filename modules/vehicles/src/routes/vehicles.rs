use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{CreateVehicleRequest, Vehicle};
use crate::services::vehicle_service::VehicleError;
use crate::AppState;

#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for VehicleError {
    fn into_response(self) -> Response {
        let status = match &self {
            VehicleError::NotFound(_) => StatusCode::NOT_FOUND,
            VehicleError::Validation(_) | VehicleError::UnknownVehicleType(_) => StatusCode::BAD_REQUEST,
            VehicleError::DuplicatePlate(_) => StatusCode::CONFLICT,
            VehicleError::Database(e) => {
                tracing::error!(error = %e, "Vehicle request failed");
                let body = Json(ErrorResponse {
                    error: "Database error".to_string(),
                });
                return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
            }
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// POST /api/vehicles
pub async fn create_vehicle(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVehicleRequest>,
) -> Result<(StatusCode, Json<Vehicle>), VehicleError> {
    let vehicle = state.vehicles.create(req).await?;
    Ok((StatusCode::CREATED, Json(vehicle)))
}

/// GET /api/vehicles/{id}
pub async fn get_vehicle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vehicle>, VehicleError> {
    Ok(Json(state.vehicles.get(id).await?))
}
