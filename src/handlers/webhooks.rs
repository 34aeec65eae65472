use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::tokens_match;
use crate::services::supplier_events::SupplierEvent;
use crate::webhooks::{verify_now, PaymentEvent, SIGNATURE_HEADER};
use crate::{errors::ServiceError, AppState};

/// POST /api/v1/webhooks/payments
///
/// The raw body is verified before it is parsed. Understood events are
/// acknowledged with 200 even when settlement ended in a refund.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let payments = &state.config.payments;
    match payments.webhook_secret.as_deref() {
        Some(secret) => {
            let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
            if let Err(e) = verify_now(header, &body, secret, payments.webhook_tolerance_secs) {
                warn!(error = %e, "Payment webhook signature verification failed");
                return Err(e.into());
            }
        }
        None if state.config.is_production() => {
            return Err(ServiceError::ServiceUnavailable(
                "webhook signing secret is not configured".to_string(),
            ));
        }
        None => warn!("Accepting unsigned payment webhook; no signing secret configured"),
    }

    let envelope: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::InvalidInput(format!("invalid json: {}", e)))?;
    let event_id = envelope["id"].as_str().unwrap_or_default().to_string();
    let event = PaymentEvent::from_envelope(&envelope)?;
    let disposition = state.services.payment_events.apply(event).await?;
    info!(%event_id, ?disposition, "Payment webhook processed");

    Ok((
        StatusCode::OK,
        Json(json!({ "received": true, "disposition": disposition })),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct SupplierWebhookQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// POST /api/v1/webhooks/supplier
///
/// The supplier cannot sign deliveries, so the registered callback URL carries
/// a shared `token` query parameter instead.
pub async fn supplier_webhook(
    State(state): State<AppState>,
    Query(query): Query<SupplierWebhookQuery>,
    Json(envelope): Json<Value>,
) -> Result<impl IntoResponse, ServiceError> {
    match state.config.supplier.webhook_token.as_deref() {
        Some(expected) => {
            let presented = query.token.as_deref().unwrap_or_default();
            if !tokens_match(presented, expected) {
                warn!("Rejected supplier webhook with an invalid token");
                return Err(ServiceError::Unauthorized("invalid webhook token".to_string()));
            }
        }
        None if state.config.is_production() => {
            return Err(ServiceError::ServiceUnavailable(
                "supplier webhook token is not configured".to_string(),
            ));
        }
        None => warn!("Accepting unauthenticated supplier webhook; no token configured"),
    }

    let event = SupplierEvent::from_envelope(&envelope)?;
    let disposition = state.services.supplier_events.apply(event).await?;
    Ok((
        StatusCode::OK,
        Json(json!({ "received": true, "disposition": disposition })),
    ))
}
