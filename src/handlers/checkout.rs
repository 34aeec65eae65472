use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use uuid::Uuid;

use crate::services::checkout_intent::{CreateCheckoutRequest, IntentBreakdown};
use crate::{errors::ServiceError, ApiResponse, AppState};

/// POST /api/v1/checkout
///
/// Prices the cart server-side and returns the hosted checkout URL.
pub async fn create_checkout(
    State(state): State<AppState>,
    Json(payload): Json<CreateCheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let created = state.services.checkout.create_checkout(payload).await?;
    Ok((StatusCode::OK, Json(created)))
}

// GET /api/v1/checkout/intents/:id
pub async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let intent = state.services.checkout.get_intent(id).await?;
    Ok(Json(ApiResponse::success(IntentBreakdown::from(intent))))
}
