mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use marketplace_settlement::entities::order::{self, FulfillmentStatus};
use marketplace_settlement::entities::product_variant;
use marketplace_settlement::entities::supplier_order::{self, SupplierOrderStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use uuid::Uuid;

use common::{CreateOrderMode, TestApp, JOB_TOKEN};

async fn dropship_order(app: &TestApp, payment_ref: &str) -> Uuid {
    let seller = app.seed_seller().await;
    let (product, variant) = app.seed_dropship_product(seller, 4_000, 1_500).await;
    app.paid_order(
        seller,
        json!([{ "product_id": product.id, "variant_id": variant.id.to_string(), "qty": 1 }]),
        payment_ref,
    )
    .await
}

async fn trigger(app: &TestApp, order_id: Uuid) -> (StatusCode, Value) {
    app.request(
        Method::POST,
        "/api/v1/fulfillment",
        Some(json!({ "orderId": order_id })),
    )
    .await
}

#[tokio::test]
async fn purchase_waits_until_funds_are_available() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_wait").await;

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["outcome"]["status"], "waiting_funds");

    let row = app.supplier_order(order_id).await.unwrap();
    assert_eq!(row.status, SupplierOrderStatus::WaitingFunds);
    assert_eq!(row.supplier_order_number, format!("BZ-{order_id}"));
    assert_eq!(row.estimated_cost_cents, Some(1_500));
    assert_eq!(app.order(order_id).await.fulfillment_status, FulfillmentStatus::WaitingFunds);

    app.payments.funds_pending();
    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["outcome"]["reason"].as_str().unwrap().starts_with("funds available on"));

    // settled charge but the platform balance cannot cover the supplier cost
    app.payments.funds_settled(1_000);
    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["outcome"]["reason"].as_str().unwrap().contains("below estimated supplier cost"));
    assert!(app.supplier.orders().is_empty());
}

#[tokio::test]
async fn settled_funds_place_exactly_one_supplier_order() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_submit").await;
    app.payments.funds_settled(100_000);

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"]["status"], "submitted");
    assert_eq!(body["outcome"]["supplier_order_id"], "CJ1");

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["status"], "already_fulfilled");

    let orders = app.supplier.orders();
    assert_eq!(orders.len(), 1);
    let placed = &orders[0];
    assert_eq!(placed.order_number, format!("BZ-{order_id}"));
    assert_eq!(placed.products[0].pid, "CJ-PID-1");
    assert_eq!(placed.products[0].vid.as_deref(), Some("CJ-VID-BLUE"));
    assert_eq!(placed.shipping_address.first_name, "Ada");
    assert_eq!(placed.shipping_address.last_name, "Lovelace");
    assert_eq!(placed.shipping_address.country, "US");
    assert_eq!(placed.shipping_address.zip, "94105");

    let row = app.supplier_order(order_id).await.unwrap();
    assert_eq!(row.status, SupplierOrderStatus::Fulfilled);
    assert_eq!(row.supplier_order_id.as_deref(), Some("CJ1"));
    assert_eq!(app.order(order_id).await.fulfillment_status, FulfillmentStatus::Processing);
}

#[tokio::test]
async fn concurrent_triggers_purchase_once() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_concurrent").await;
    app.payments.funds_settled(100_000);

    let (a, b) = tokio::join!(trigger(&app, order_id), trigger(&app, order_id));
    assert!(a.0.is_success() && b.0.is_success());
    assert_eq!(app.supplier.orders().len(), 1);
}

#[tokio::test]
async fn supplier_stock_blocks_the_order() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_blocked").await;
    app.payments.funds_settled(100_000);
    app.supplier.set_stock(Some(0));

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["outcome"]["status"], "blocked_inventory");
    assert!(body["outcome"]["reason"].as_str().unwrap().contains("out of stock"));
    assert!(app.supplier.orders().is_empty());
    assert_eq!(
        app.supplier_order(order_id).await.unwrap().status,
        SupplierOrderStatus::BlockedInventory
    );

    // terminal: restocking does not reopen the order
    app.supplier.set_stock(Some(10));
    let (status, _) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn supplier_rejections_are_classified() {
    let app = TestApp::new().await;
    app.payments.funds_settled(100_000);

    let stock_order = dropship_order(&app, "pi_reject_stock").await;
    app.supplier
        .set_create_mode(CreateOrderMode::Reject("Product is out of stock".to_string()));
    let (status, body) = trigger(&app, stock_order).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["outcome"]["status"], "blocked_inventory");

    let failed_order = dropship_order(&app, "pi_reject_other").await;
    app.supplier
        .set_create_mode(CreateOrderMode::Reject("shipping address is invalid".to_string()));
    let (status, body) = trigger(&app, failed_order).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
    assert_eq!(body["outcome"]["status"], "failed");
    assert_eq!(app.order(failed_order).await.fulfillment_status, FulfillmentStatus::Failed);
}

#[tokio::test]
async fn rate_limited_supplier_defers_to_the_sweep() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_deferred").await;
    app.payments.funds_settled(100_000);
    app.supplier.set_create_mode(CreateOrderMode::RateLimited);

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"]["status"], "deferred");
    assert_eq!(
        app.supplier_order(order_id).await.unwrap().status,
        SupplierOrderStatus::WaitingFunds
    );

    app.supplier.set_create_mode(CreateOrderMode::Accept);
    let (status, body) = app
        .request_with_headers(
            Method::POST,
            "/api/v1/jobs/fulfillment-sweep",
            Some(json!({ "batch_size": 10 }).to_string()),
            &[("x-job-token", JOB_TOKEN.to_string())],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["examined"], 1);
    assert_eq!(body["data"]["submitted"], 1);
    assert_eq!(app.supplier.orders().len(), 1);
}

#[tokio::test]
async fn orders_without_supplier_mapping_need_nothing() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 2_000, None, 10.0).await;
    let order_id = app
        .paid_order(seller, json!([{ "product_id": product.id, "qty": 1 }]), "pi_local")
        .await;

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["status"], "nothing_to_fulfill");
    assert!(app.supplier_order(order_id).await.is_none());

    let (status, _) = trigger(&app, Uuid::new_v4()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stale_claims_return_to_the_sweep() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_stale").await;
    let (status, _) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // a worker claimed the row and died before recording an outcome
    supplier_order::Entity::update_many()
        .col_expr(supplier_order::Column::Status, Expr::value(SupplierOrderStatus::Pending))
        .col_expr(
            supplier_order::Column::UpdatedAt,
            Expr::value(Utc::now() - Duration::hours(2)),
        )
        .filter(supplier_order::Column::OrderId.eq(order_id))
        .exec(app.db())
        .await
        .unwrap();
    let (_, body) = trigger(&app, order_id).await;
    assert_eq!(body["outcome"]["status"], "in_progress");

    app.payments.funds_settled(100_000);
    let (status, body) = app
        .request_with_headers(
            Method::POST,
            "/api/v1/jobs/fulfillment-sweep",
            None,
            &[("x-job-token", JOB_TOKEN.to_string())],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["recovered"], 1);
    assert_eq!(body["data"]["submitted"], 1);
    assert_eq!(app.supplier.orders().len(), 1);
}

#[tokio::test]
async fn fresh_claims_are_not_recovered() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_fresh_claim").await;
    trigger(&app, order_id).await;
    supplier_order::Entity::update_many()
        .col_expr(supplier_order::Column::Status, Expr::value(SupplierOrderStatus::Pending))
        .filter(supplier_order::Column::OrderId.eq(order_id))
        .exec(app.db())
        .await
        .unwrap();

    let recovered = app
        .state
        .services
        .fulfillment
        .recover_stale_claims(Utc::now())
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(
        app.supplier_order(order_id).await.unwrap().status,
        SupplierOrderStatus::Pending
    );
}

async fn supplier_event(app: &TestApp, event: Value) -> (StatusCode, Value) {
    app.request(Method::POST, "/api/v1/webhooks/supplier", Some(event)).await
}

#[tokio::test]
async fn supplier_updates_move_the_order_forward() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_tracking").await;
    app.payments.funds_settled(100_000);
    let (status, _) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::OK);
    let number = format!("BZ-{order_id}");

    let (status, body) = supplier_event(
        &app,
        json!({ "eventType": "TRACKING_NUMBER_UPDATE", "data": {
            "orderNumber": number, "trackingNumber": "YT2300001", "trackingUrl": "https://track.test/YT2300001"
        }}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["disposition"]["result"], "applied");
    assert_eq!(body["disposition"]["advanced"], true);
    assert_eq!(app.order(order_id).await.fulfillment_status, FulfillmentStatus::Shipped);
    let row = app.supplier_order(order_id).await.unwrap();
    assert_eq!(row.tracking_number.as_deref(), Some("YT2300001"));

    let (_, body) = supplier_event(
        &app,
        json!({ "eventType": "ORDER_STATUS_UPDATE", "data": { "orderNumber": number, "status": "DELIVERED" } }),
    )
    .await;
    assert_eq!(body["disposition"]["fulfillment_status"], "delivered");
    assert_eq!(app.order(order_id).await.fulfillment_status, FulfillmentStatus::Delivered);
    assert_eq!(
        app.supplier_order(order_id).await.unwrap().supplier_status.as_deref(),
        Some("delivered")
    );

    // a late status never moves a delivered order back
    let (_, body) = supplier_event(
        &app,
        json!({ "eventType": "ORDER_STATUS_UPDATE", "data": { "orderNumber": number, "status": "SHIPPED" } }),
    )
    .await;
    assert_eq!(body["disposition"]["advanced"], false);
    assert_eq!(app.order(order_id).await.fulfillment_status, FulfillmentStatus::Delivered);

    let (status, body) = supplier_event(
        &app,
        json!({ "eventType": "ORDER_STATUS_UPDATE", "data": { "orderNumber": "BZ-unknown", "status": "SHIPPED" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"]["result"], "unknown_order");
}

#[tokio::test]
async fn early_shipping_update_is_not_reverted_by_submission() {
    let app = TestApp::new().await;
    let order_id = dropship_order(&app, "pi_early_ship").await;
    app.payments.funds_settled(100_000);
    // the supplier reports shipment before the purchase call returns
    order::Entity::update_many()
        .col_expr(order::Column::FulfillmentStatus, Expr::value(FulfillmentStatus::Shipped))
        .filter(order::Column::Id.eq(order_id))
        .exec(app.db())
        .await
        .unwrap();

    let (status, body) = trigger(&app, order_id).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"]["status"], "submitted");
    assert_eq!(app.order(order_id).await.fulfillment_status, FulfillmentStatus::Shipped);
    assert_eq!(
        app.supplier_order(order_id).await.unwrap().status,
        SupplierOrderStatus::Fulfilled
    );
}

#[tokio::test]
async fn supplier_webhook_checks_the_configured_token() {
    let app = TestApp::with_config(|cfg| cfg.supplier.webhook_token = Some("cj-hook".to_string())).await;
    let event = json!({ "eventType": "PRICE_UPDATE", "data": { "pid": "CJ-PID-1" } });

    let (status, _) = supplier_event(&app, event.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .request(Method::POST, "/api/v1/webhooks/supplier?token=cj-hook", Some(event))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"]["result"], "ignored");
}

#[tokio::test]
async fn supplier_stock_updates_sync_mapped_variants() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let (_, variant) = app.seed_dropship_product(seller, 4_000, 1_500).await;

    let (status, body) = supplier_event(
        &app,
        json!({ "eventType": "INVENTORY_UPDATE", "data": { "pid": "CJ-PID-1", "vid": "CJ-VID-BLUE", "stock": 7 } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["disposition"]["variants"], 1);

    let variant = product_variant::Entity::find_by_id(variant.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(variant.stock_quantity, Some(7));
}

mod live_supplier {
    use super::*;
    use marketplace_settlement::entities::supplier_token;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_supplier(server: &MockServer, stock: i64) {
        Mock::given(method("POST"))
            .and(path("/authentication/getAccessToken"))
            .and(body_partial_json(json!({ "apiKey": "cj-test-key" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": true,
                "data": { "accessToken": "cj-token", "accessTokenExpiryDate": "2099-01-01T00:00:00+00:00" }
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/product/inventory/query"))
            .and(header("CJ-Access-Token", "cj-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": true,
                "data": { "stockNumber": stock }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn order_is_placed_through_the_supplier_api() {
        let server = MockServer::start().await;
        mount_supplier(&server, 25).await;
        Mock::given(method("POST"))
            .and(path("/shopping/order/createOrder"))
            .and(body_partial_json(json!({
                "logisticName": "CJ shipping",
                "shippingAddress": { "zip": "94105", "country": "US" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": true,
                "data": { "cjOrderId": "CJ-LIVE-7" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let app = TestApp::with_supplier_server(&server.uri()).await;
        let order_id = dropship_order(&app, "pi_live").await;
        app.payments.funds_settled(100_000);

        let (status, body) = trigger(&app, order_id).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["outcome"]["supplier_order_id"], "CJ-LIVE-7");
        assert_eq!(
            app.supplier_order(order_id).await.unwrap().supplier_order_id.as_deref(),
            Some("CJ-LIVE-7")
        );

        // the access token survives in the database for the next process
        let token = supplier_token::Entity::find_by_id(1).one(app.db()).await.unwrap().unwrap();
        assert_eq!(token.access_token, "cj-token");
    }

    #[tokio::test]
    async fn live_stock_shortfall_blocks_before_purchase() {
        let server = MockServer::start().await;
        mount_supplier(&server, 0).await;
        Mock::given(method("POST"))
            .and(path("/shopping/order/createOrder"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let app = TestApp::with_supplier_server(&server.uri()).await;
        let order_id = dropship_order(&app, "pi_live_empty").await;
        app.payments.funds_settled(100_000);

        let (status, body) = trigger(&app, order_id).await;
        assert_eq!(status, StatusCode::CONFLICT, "{body}");
        assert_eq!(body["outcome"]["status"], "blocked_inventory");
    }
}
