use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod metrics;
pub mod scans;

/// Health and scan routes. `/metrics` and the HTTP layers are added by the
/// server binary.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/scans", post(scans::submit_scan))
        .route("/api/v1/scans/{id}", get(scans::get_scan))
        .route("/api/v1/scans/{id}/status", get(scans::get_scan_status))
        .route("/api/v1/scans/{id}/reprocess", post(scans::reprocess_scan))
        .route("/api/v1/scans/{id}/metadata", post(scans::update_scan_metadata))
        .with_state(state)
}
