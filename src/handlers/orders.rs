use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

use crate::auth::CallerIdentity;
use crate::services::order_completion::CompletionRequest;
use crate::{errors::ServiceError, ApiResponse, AppState};

/// Explicit completion call made after the buyer returns from checkout.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CompleteOrderRequest {
    #[serde(alias = "checkout_intent_id")]
    pub checkout_intent_id: Uuid,
    #[serde(alias = "payment_intent_id")]
    #[validate(length(min = 1, max = 255))]
    pub payment_intent_id: String,
    #[serde(default, alias = "declared_total_cents")]
    #[validate(range(min = 0))]
    pub declared_total_cents: Option<i64>,
    #[serde(default, alias = "billing_email")]
    #[validate(email)]
    pub billing_email: Option<String>,
    #[serde(default, alias = "billing_name")]
    pub billing_name: Option<String>,
    #[serde(default, alias = "shipping_address")]
    pub shipping_address: Option<Value>,
}

impl From<CompleteOrderRequest> for CompletionRequest {
    fn from(req: CompleteOrderRequest) -> Self {
        Self {
            checkout_intent_id: req.checkout_intent_id,
            payment_intent_id: req.payment_intent_id,
            declared_total_cents: req.declared_total_cents,
            billing_email: req.billing_email,
            billing_name: req.billing_name,
            shipping_address: req.shipping_address,
        }
    }
}

/// POST /api/v1/orders/complete
///
/// Idempotent per payment reference. The payment is confirmed with the
/// processor first. A stock shortfall answers 409 with the refund outcome.
pub async fn complete_order(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(payload): Json<CompleteOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    payload.validate()?;
    debug!(caller = %caller.user_id, intent_id = %payload.checkout_intent_id, "Explicit order completion");
    let result = state.services.completion.complete_verified(payload.into()).await?;
    Ok(Json(ApiResponse::success(result)))
}
