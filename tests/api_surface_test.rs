mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use common::{TestApp, JOB_TOKEN};

#[tokio::test]
async fn health_reports_database_status() {
    let app = TestApp::new().await;
    let (status, body) = app.request(Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "up");
    assert_eq!(body["data"]["checks"]["database"]["status"], "up");
}

#[tokio::test]
async fn errors_echo_the_request_id() {
    let app = TestApp::new().await;
    let (status, body) = app
        .request_with_headers(
            Method::GET,
            &format!("/api/v1/checkout/intents/{}", Uuid::new_v4()),
            None,
            &[("x-request-id", "req-abc-123".to_string())],
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["request_id"], "req-abc-123");
}

#[tokio::test]
async fn supplier_proxy_relays_relative_endpoints_only() {
    let app = TestApp::new().await;
    let job = [("x-job-token", JOB_TOKEN.to_string())];

    let (status, body) = app
        .request_with_headers(
            Method::POST,
            "/api/v1/supplier/proxy",
            Some(json!({ "endpoint": "/product/list", "method": "get", "body": { "pageNum": 1 } }).to_string()),
            &job,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["endpoint"], "product/list");
    assert_eq!(body["method"], "GET");
    assert_eq!(body["echo"]["pageNum"], 1);

    let (status, _) = app
        .request_with_headers(
            Method::POST,
            "/api/v1/supplier/proxy",
            Some(json!({ "endpoint": "https://elsewhere.test/steal" }).to_string()),
            &job,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn supplier_proxy_is_closed_to_ordinary_callers() {
    let app = TestApp::new().await;
    let body = Some(json!({ "endpoint": "shopping/order/createOrderV2" }).to_string());

    let (status, _) = app
        .request_with_headers(Method::POST, "/api/v1/supplier/proxy", body.clone(), &[])
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let buyer = app.seed_seller().await;
    let (status, _) = app
        .request_with_headers(
            Method::POST,
            "/api/v1/supplier/proxy",
            body,
            &[("x-caller-id", buyer.to_string())],
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn explicit_completion_requires_a_caller() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(
            Method::POST,
            "/api/v1/orders/complete",
            Some(json!({ "checkoutIntentId": Uuid::new_v4(), "paymentIntentId": "pi_x" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn fulfillment_sweep_requires_authorization() {
    let app = TestApp::new().await;
    let (status, _) = app
        .request(Method::POST, "/api/v1/jobs/fulfillment-sweep", None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
