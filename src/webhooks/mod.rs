//! Inbound payment processor webhooks: signature verification and event decoding.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

impl From<SignatureError> for ServiceError {
    fn from(err: SignatureError) -> Self {
        ServiceError::Unauthorized(format!("invalid webhook signature: {}", err))
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verifies a `t=<unix>,v1=<hex>[,v1=<hex>...]` header against `payload`.
/// Any one matching `v1` entry is accepted.
pub fn verify_signature(
    header: Option<&str>,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > tolerance_secs {
        return Err(SignatureError::Expired);
    }

    let expected = sign_payload(secret, timestamp, payload);
    if signatures
        .iter()
        .any(|sig| constant_time_eq(expected.as_bytes(), sig.as_bytes()))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Same as [`verify_signature`] against the current clock.
pub fn verify_now(
    header: Option<&str>,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    verify_signature(header, payload, secret, tolerance_secs, Utc::now().timestamp())
}

/// The processor events the settlement core acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    CheckoutSessionCompleted {
        session_id: String,
        checkout_intent_id: Option<Uuid>,
        payment_intent_id: Option<String>,
        amount_total_cents: Option<i64>,
        billing_email: Option<String>,
        billing_name: Option<String>,
        shipping_address: Option<Value>,
    },
    PaymentSucceeded {
        payment_intent_id: String,
        checkout_intent_id: Option<Uuid>,
        amount_cents: Option<i64>,
    },
    PaymentFailed {
        payment_intent_id: String,
        checkout_intent_id: Option<Uuid>,
        reason: Option<String>,
    },
    Ignored {
        event_type: String,
    },
}

fn opt_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn intent_id(object: &Value) -> Option<Uuid> {
    object["metadata"]["checkout_intent_id"]
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
}

impl PaymentEvent {
    /// Decodes an event envelope `{ id, type, data: { object } }`.
    pub fn from_envelope(envelope: &Value) -> Result<Self, ServiceError> {
        let event_type = envelope["type"]
            .as_str()
            .ok_or_else(|| ServiceError::InvalidInput("event type missing".to_string()))?;
        let object = &envelope["data"]["object"];
        if !object.is_object() {
            return Err(ServiceError::InvalidInput("event object missing".to_string()));
        }

        let event = match event_type {
            "checkout.session.completed" => {
                let details = &object["customer_details"];
                let shipping = if object["shipping_details"]["address"].is_object() {
                    Some(object["shipping_details"]["address"].clone())
                } else if details["address"].is_object() {
                    Some(details["address"].clone())
                } else {
                    None
                };
                Self::CheckoutSessionCompleted {
                    session_id: opt_string(&object["id"]).ok_or_else(|| {
                        ServiceError::InvalidInput("session id missing".to_string())
                    })?,
                    checkout_intent_id: intent_id(object),
                    payment_intent_id: opt_string(&object["payment_intent"]),
                    amount_total_cents: object["amount_total"].as_i64(),
                    billing_email: opt_string(&details["email"]),
                    billing_name: opt_string(&details["name"])
                        .or_else(|| opt_string(&object["shipping_details"]["name"])),
                    shipping_address: shipping,
                }
            }
            "payment_intent.succeeded" | "payment_intent.payment_failed" => {
                let payment_intent_id = opt_string(&object["id"]).ok_or_else(|| {
                    ServiceError::InvalidInput("payment intent id missing".to_string())
                })?;
                if event_type == "payment_intent.succeeded" {
                    Self::PaymentSucceeded {
                        payment_intent_id,
                        checkout_intent_id: intent_id(object),
                        amount_cents: object["amount_received"]
                            .as_i64()
                            .or_else(|| object["amount"].as_i64()),
                    }
                } else {
                    Self::PaymentFailed {
                        payment_intent_id,
                        checkout_intent_id: intent_id(object),
                        reason: opt_string(&object["last_payment_error"]["message"]),
                    }
                }
            }
            other => Self::Ignored {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }
}
