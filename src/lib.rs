//! Marketplace settlement service
//!
//! Checkout pricing, order settlement, funds-gated drop-ship fulfillment and
//! scheduled payouts for a multi-party marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod clients;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod jobs;
pub mod middleware_helpers;
pub mod migrator;
pub mod services;
pub mod tracing;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;

use crate::clients::{PaymentProcessor, StripeClient, SupplierApi, SupplierClient};
use crate::errors::ServiceError;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        payments: Arc<dyn PaymentProcessor>,
        supplier: Arc<dyn SupplierApi>,
    ) -> Self {
        let services = handlers::AppServices::new(db.clone(), &config, payments, supplier);
        Self {
            db,
            config,
            services,
        }
    }

    /// Builds the state with the live payment processor and supplier clients.
    /// Must be called inside a tokio runtime; the supplier queue worker is spawned here.
    pub fn with_live_clients(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
    ) -> Result<Self, ServiceError> {
        let payments: Arc<dyn PaymentProcessor> = Arc::new(StripeClient::new(&config.payments)?);
        let supplier: Arc<dyn SupplierApi> =
            Arc::new(SupplierClient::new(&config.supplier, Some(db.clone()))?);
        Ok(Self::new(db, config, payments, supplier))
    }
}

#[derive(Serialize, Debug)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Envelope for operational read endpoints.
#[derive(Serialize, Debug)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/checkout", post(handlers::checkout::create_checkout))
        .route("/checkout/intents/:id", get(handlers::checkout::get_intent))
        .route("/orders/complete", post(handlers::orders::complete_order))
        .route("/webhooks/payments", post(handlers::webhooks::payment_webhook))
        .route("/webhooks/supplier", post(handlers::webhooks::supplier_webhook))
        .route("/fulfillment", post(handlers::fulfillment::trigger_fulfillment))
        .route("/supplier/proxy", post(handlers::supplier_proxy::proxy))
        .route("/jobs/fulfillment-sweep", post(handlers::jobs::fulfillment_sweep))
        .route("/jobs/release-held", post(handlers::jobs::release_held))
        .route("/jobs/payouts", post(handlers::jobs::run_payouts))
}

/// The API router with request ids and HTTP tracing, without transport layers.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_omits_data() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-err"), async {
                ApiResponse::<()>::error("oops".into())
            })
            .await;

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
        assert_eq!(json["meta"]["request_id"], "meta-err");
    }
}
