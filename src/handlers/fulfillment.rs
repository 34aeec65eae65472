use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{errors::ServiceError, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentTrigger {
    #[serde(alias = "order_id")]
    pub order_id: Uuid,
}

/// POST /api/v1/fulfillment
///
/// 200 when placed or nothing to do, 202 while waiting on funds or another
/// attempt, 409 when supplier stock blocks the order, 502 when the supplier
/// rejected it.
pub async fn trigger_fulfillment(
    State(state): State<AppState>,
    Json(payload): Json<FulfillmentTrigger>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.services.fulfillment.fulfill(payload.order_id).await?;
    let status = outcome.status_code();
    Ok((
        status,
        Json(json!({
            "success": status.is_success(),
            "orderId": payload.order_id,
            "outcome": outcome,
        })),
    ))
}
