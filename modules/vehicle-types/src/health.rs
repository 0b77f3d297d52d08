use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppState;

/// Health check endpoint handler
///
/// Reports outbox backlog so a stuck publisher is visible from the outside.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.outbox.count_by_status().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "vehicle-types-rs",
                "version": env!("CARGO_PKG_VERSION"),
                "outbox": {
                    "pending": counts.pending,
                    "published": counts.published,
                    "failed": counts.failed,
                }
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read outbox");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": "vehicle-types-rs",
                    "version": env!("CARGO_PKG_VERSION"),
                })),
            )
        }
    }
}
