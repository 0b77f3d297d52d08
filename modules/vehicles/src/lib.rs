pub mod config;
pub mod consumer;
pub mod db;
pub mod health;
pub mod models;
pub mod repos;
pub mod routes;
pub mod services;

pub use consumer::vehicle_type_consumer::{start_vehicle_type_consumer, vehicle_type_consumer};

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::services::vehicle_service::VehicleService;

pub struct AppState {
    pub vehicles: VehicleService,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    use routes::vehicles::{create_vehicle, get_vehicle};

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/vehicles", post(create_vehicle))
        .route("/api/vehicles/{id}", get(get_vehicle))
        .with_state(state)
}
