use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: DatabaseHealth,
    pub ocr_queue: QueueHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub capacity: usize,
    /// New scans are being rejected.
    pub saturated: bool,
}

/// GET /health — database reachability and OCR queue saturation.
///
/// Only an unreachable database makes the service unhealthy; a full queue
/// sheds uploads but status queries still work.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match db::ping(&state.db).await {
        Ok(latency) => DatabaseHealth {
            reachable: true,
            latency_ms: Some(latency.as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            DatabaseHealth {
                reachable: false,
                latency_ms: None,
            }
        }
    };

    let depth = state.queue.depth();
    let capacity = state.queue.capacity();
    let ocr_queue = QueueHealth {
        depth,
        capacity,
        saturated: depth >= capacity,
    };

    let (code, status) = match (database.reachable, ocr_queue.saturated) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        (true, true) => (StatusCode::OK, "degraded"),
        (true, false) => (StatusCode::OK, "ok"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
            ocr_queue,
        }),
    )
}
