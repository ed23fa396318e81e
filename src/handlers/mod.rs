use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub mod health;
pub mod operations;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/v1/{collection}/{id}/cascade_delete",
            post(operations::trigger_cascade_delete),
        )
        .route(
            "/api/v1/{collection}/{id}/operations",
            post(operations::submit_operation),
        )
        .route("/api/v1/operations", get(operations::list_operations))
        .route("/api/v1/operations/{id}", get(operations::get_operation))
        .route("/api/v1/maintenance/cleanup", post(operations::run_cleanup))
        .with_state(state)
}
