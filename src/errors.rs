use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Standard error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error code, when one applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// Machine codes reported by checkout validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutErrorCode {
    EmptyCart,
    InvalidQuantity,
    ProductNotFound,
    ProductSellerMismatch,
    ProductInactive,
    ProductNotPromotable,
    InvalidPrice,
    InvalidVariant,
    OutOfStock,
    ReferralFundraiserConflict,
    SellerNotPayable,
    AffiliateNotPayable,
    ReferrerNotPayable,
    FundraiserNotPayable,
    InvalidCurrency,
}

impl CheckoutErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::OutOfStock => StatusCode::CONFLICT,
            Self::ProductNotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// A checkout rejected before anything was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRejection {
    #[serde(rename = "error")]
    pub message: String,
    pub code: CheckoutErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<i32>,
}

impl CheckoutRejection {
    pub fn new(code: CheckoutErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            product_id: None,
            variant_id: None,
            requested: None,
            available: None,
        }
    }

    pub fn for_product(mut self, product_id: Uuid) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn for_variant(mut self, variant_ref: impl Into<String>) -> Self {
        self.variant_id = Some(variant_ref.into());
        self
    }

    pub fn out_of_stock(product_id: Uuid, variant_id: Option<String>, requested: i32, available: i32) -> Self {
        Self {
            message: format!(
                "insufficient inventory, requested {} available {}",
                requested, available
            ),
            code: CheckoutErrorCode::OutOfStock,
            product_id: Some(product_id),
            variant_id,
            requested: Some(requested),
            available: Some(available.max(0)),
        }
    }
}

/// Which stock counter refused a settlement-time decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StockKind {
    Product,
    Variant,
}

/// Stock ran out between checkout and settlement; money was already collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfStockConflict {
    pub kind: StockKind,
    pub id: Uuid,
    pub refunded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{}", .0.message)]
    Checkout(CheckoutRejection),

    #[error("Out of stock: {} {}", .0.kind, .0.id)]
    OutOfStock(OutOfStockConflict),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl From<CheckoutRejection> for ServiceError {
    fn from(rejection: CheckoutRejection) -> Self {
        ServiceError::Checkout(rejection)
    }
}

impl ServiceError {
    pub fn db_error(error: DbErr) -> Self {
        ServiceError::DatabaseError(error)
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Checkout(rejection) => rejection.code.status(),
            Self::OutOfStock(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Machine code for errors that carry one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::OutOfStock(_) => Some("OUT_OF_STOCK"),
            Self::RateLimitExceeded { .. } => Some("RATE_LIMITED"),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = current_request_id();
        let timestamp = chrono::Utc::now().to_rfc3339();

        match self {
            // Checkout rejections keep their structured fields at the top level.
            Self::Checkout(rejection) => {
                let mut body = json!(rejection);
                body["request_id"] = json!(request_id);
                body["timestamp"] = json!(timestamp);
                (status, Json(body)).into_response()
            }
            Self::OutOfStock(conflict) => {
                let body = json!({
                    "error": "Insufficient inventory",
                    "code": "OUT_OF_STOCK",
                    "kind": conflict.kind,
                    "id": conflict.id,
                    "order_id": conflict.order_id,
                    "refunded": conflict.refunded,
                    "request_id": request_id,
                    "timestamp": timestamp,
                });
                (status, Json(body)).into_response()
            }
            other => {
                let retry_after = match &other {
                    Self::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
                    _ => None,
                };
                let err = ErrorResponse {
                    error: status.canonical_reason().unwrap_or("Error").to_string(),
                    message: other.response_message(),
                    code: other.code().map(str::to_string),
                    request_id,
                    timestamp,
                };
                let mut response = (status, Json(err)).into_response();
                if let Some(secs) = retry_after {
                    if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                response
            }
        }
    }
}
