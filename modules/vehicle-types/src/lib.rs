pub mod config;
pub mod db;
pub mod events;
pub mod health;
pub mod models;
pub mod repos;
pub mod routes;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use outbox::OutboxStore;
use std::sync::Arc;

use crate::services::vehicle_type_service::VehicleTypeService;

/// Shared handler state
pub struct AppState {
    pub vehicle_types: VehicleTypeService,
    pub outbox: Arc<dyn OutboxStore>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    use routes::vehicle_types::{
        create_vehicle_type, delete_vehicle_type, get_vehicle_type, update_vehicle_type,
    };

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/vehicle-types", post(create_vehicle_type))
        .route(
            "/api/vehicle-types/{id}",
            get(get_vehicle_type)
                .patch(update_vehicle_type)
                .delete(delete_vehicle_type),
        )
        .with_state(state)
}
