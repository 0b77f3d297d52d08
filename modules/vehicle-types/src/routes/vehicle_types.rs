//! Vehicle type HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{CreateVehicleTypeRequest, UpdateVehicleTypeRequest, VehicleType};
use crate::services::vehicle_type_service::VehicleTypeError;
use crate::AppState;

#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct VehicleTypeHttpError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for VehicleTypeHttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse { error: self.message });
        (self.status, body).into_response()
    }
}

impl From<VehicleTypeError> for VehicleTypeHttpError {
    fn from(error: VehicleTypeError) -> Self {
        let status = match &error {
            VehicleTypeError::NotFound(_) => StatusCode::NOT_FOUND,
            VehicleTypeError::Validation(_) => StatusCode::BAD_REQUEST,
            VehicleTypeError::DuplicateName(_) => StatusCode::CONFLICT,
            VehicleTypeError::Outbox(_) | VehicleTypeError::Database(_) => {
                tracing::error!(error = %error, "Vehicle type request failed");
                return VehicleTypeHttpError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Internal error".to_string(),
                };
            }
        };
        VehicleTypeHttpError {
            status,
            message: error.to_string(),
        }
    }
}

/// POST /api/vehicle-types
pub async fn create_vehicle_type(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVehicleTypeRequest>,
) -> Result<(StatusCode, Json<VehicleType>), VehicleTypeHttpError> {
    let created = state.vehicle_types.create(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/vehicle-types/{id}
pub async fn get_vehicle_type(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<VehicleType>, VehicleTypeHttpError> {
    Ok(Json(state.vehicle_types.get(id).await?))
}

/// PATCH /api/vehicle-types/{id}
pub async fn update_vehicle_type(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(changes): Json<UpdateVehicleTypeRequest>,
) -> Result<Json<VehicleType>, VehicleTypeHttpError> {
    Ok(Json(state.vehicle_types.update(id, changes).await?))
}

/// DELETE /api/vehicle-types/{id}
pub async fn delete_vehicle_type(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, VehicleTypeHttpError> {
    state.vehicle_types.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
