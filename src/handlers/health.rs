use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use std::time::Instant;

use crate::{ApiResponse, AppState};

/// Liveness plus a database ping.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let start = Instant::now();
    let db_result = crate::db::check_connection(&state.db).await;
    let db_latency = start.elapsed().as_millis() as u64;

    let body = json!({
        "status": if db_result.is_ok() { "up" } else { "down" },
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "database": {
                "status": if db_result.is_ok() { "up" } else { "down" },
                "latency_ms": db_latency,
                "error": db_result.as_ref().err().map(|e| e.to_string()),
            }
        }
    });
    let status = if db_result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ApiResponse::success(body)))
}
