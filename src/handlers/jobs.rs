use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::auth::JobAccess;
use crate::services::earnings::ReleaseScope;
use crate::services::payouts::PayoutRunRequest;
use crate::{errors::ServiceError, ApiResponse, AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SweepRequest {
    #[serde(alias = "batchSize")]
    pub batch_size: Option<u64>,
}

/// POST /api/v1/jobs/fulfillment-sweep
pub async fn fulfillment_sweep(
    State(state): State<AppState>,
    access: JobAccess,
    payload: Option<Json<SweepRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let batch_size = payload
        .and_then(|Json(p)| p.batch_size)
        .unwrap_or(state.config.jobs.sweep_batch_size)
        .max(1);
    info!(?access, batch_size, "Fulfillment sweep requested");
    let summary = state.services.fulfillment.sweep(batch_size).await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// POST /api/v1/jobs/release-held
pub async fn release_held(
    State(state): State<AppState>,
    access: JobAccess,
) -> Result<impl IntoResponse, ServiceError> {
    info!(?access, "Held distribution release requested");
    let summary = state
        .services
        .earnings
        .release_held(ReleaseScope::Due { now: Utc::now() })
        .await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// POST /api/v1/jobs/payouts
pub async fn run_payouts(
    State(state): State<AppState>,
    access: JobAccess,
    payload: Option<Json<PayoutRunRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let request = payload.map(|Json(p)| p).unwrap_or_default();
    let report = state
        .services
        .payouts
        .run_batch(request, &access, Utc::now())
        .await?;
    Ok(Json(report))
}
