mod common;

use axum::http::StatusCode;
use marketplace_settlement::entities::checkout_intent::IntentStatus;
use marketplace_settlement::entities::order::{OrderStatus, PaymentStatus};
use marketplace_settlement::entities::payment_distribution::{
    self, DistributionStatus, RecipientType,
};
use marketplace_settlement::entities::user_earning::EarningRole;
use marketplace_settlement::entities::{commission, order_item, recruiter_earning};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

use common::TestApp;

#[tokio::test]
async fn completion_settles_once_per_payment() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 10_000, Some(3), 10.0).await;
    let intent_id = app
        .checkout(seller, json!([{ "product_id": product.id, "qty": 1 }]), json!({}))
        .await;

    let (status, first) = app.complete(intent_id, "pi_first").await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["data"]["status"], "completed");
    assert_eq!(first["data"]["already_processed"], false);
    assert_eq!(first["data"]["total_cents"], 11_875);

    let (status, again) = app.complete(intent_id, "pi_first").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["data"]["already_processed"], true);
    assert_eq!(again["data"]["order_id"], first["data"]["order_id"]);

    let order_id = Uuid::parse_str(first["data"]["order_id"].as_str().unwrap()).unwrap();
    let order = app.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.billing_email.as_deref(), Some("buyer@example.test"));

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(app.db())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].seller_amount_cents, 10_000);
    assert_eq!(items[0].processor_fee_cents, 375);

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, Some(2));
    assert_eq!(product.sales_count, 1);

    let seller_balance = app.earning(seller, EarningRole::Seller).await.unwrap();
    assert_eq!(seller_balance.held_balance_cents, 10_000);
    assert_eq!(seller_balance.current_balance_cents, 0);

    let intent = app.state.services.checkout.get_intent(intent_id).await.unwrap();
    assert_eq!(intent.status, IntentStatus::Completed);
    assert_eq!(intent.provider_payment_intent_id.as_deref(), Some("pi_first"));
}

#[tokio::test]
async fn completion_writes_the_attribution_ledger() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let recruiter = app.seed_affiliate(None).await;
    let affiliate = app.seed_affiliate(Some(recruiter)).await;
    let product = app.seed_product(seller, 10_000, None, 10.0).await;
    let intent_id = app
        .checkout(
            seller,
            json!([{ "product_id": product.id, "qty": 1 }]),
            json!({ "affiliate_id": affiliate }),
        )
        .await;

    let (status, body) = app.complete(intent_id, "pi_ledger").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let order_id = Uuid::parse_str(body["data"]["order_id"].as_str().unwrap()).unwrap();

    let commissions = commission::Entity::find()
        .filter(commission::Column::OrderId.eq(order_id))
        .all(app.db())
        .await
        .unwrap();
    assert_eq!(commissions.len(), 1);
    assert_eq!(commissions[0].affiliate_id, affiliate);
    assert_eq!(commissions[0].amount_cents, 1_000);

    let recruiter_rows = recruiter_earning::Entity::find()
        .filter(recruiter_earning::Column::OrderId.eq(order_id))
        .all(app.db())
        .await
        .unwrap();
    assert_eq!(recruiter_rows.len(), 1);
    assert_eq!(recruiter_rows[0].recruiter_id, recruiter);
    assert_eq!(recruiter_rows[0].recruit_id, affiliate);
    assert_eq!(recruiter_rows[0].amount_cents, 500);

    let distributions = payment_distribution::Entity::find()
        .filter(payment_distribution::Column::OrderId.eq(order_id))
        .all(app.db())
        .await
        .unwrap();
    let seller_row = distributions
        .iter()
        .find(|d| d.recipient_type == RecipientType::Seller)
        .unwrap();
    assert_eq!(seller_row.status, DistributionStatus::Held);
    assert!(seller_row.available_at.is_some());
    assert!(distributions
        .iter()
        .any(|d| d.recipient_type == RecipientType::Referral && d.recipient_id == Some(recruiter)));
    assert!(distributions
        .iter()
        .any(|d| d.recipient_type == RecipientType::Platform && d.recipient_id.is_none()));

    assert_eq!(
        app.earning(affiliate, EarningRole::Affiliate)
            .await
            .unwrap()
            .current_balance_cents,
        1_000
    );
    assert_eq!(
        app.earning(recruiter, EarningRole::Referrer)
            .await
            .unwrap()
            .current_balance_cents,
        500
    );
}

#[tokio::test]
async fn last_unit_goes_to_exactly_one_buyer() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 5_000, Some(1), 10.0).await;
    let lines = json!([{ "product_id": product.id, "qty": 1 }]);
    let first = app.checkout(seller, lines.clone(), json!({})).await;
    let second = app.checkout(seller, lines, json!({})).await;

    let (a, b) = tokio::join!(app.complete(first, "pi_race_a"), app.complete(second, "pi_race_b"));
    let mut statuses = vec![a.0, b.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);

    let (_, loser) = if a.0 == StatusCode::CONFLICT { a } else { b };
    assert_eq!(loser["code"], "OUT_OF_STOCK");
    assert_eq!(loser["kind"], "product");
    assert_eq!(loser["refunded"], true);

    let refunded_order = Uuid::parse_str(loser["order_id"].as_str().unwrap()).unwrap();
    let order = app.order(refunded_order).await;
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);

    let refunds = app.payments.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].1, format!("oos-refund-{}", refunded_order));

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, Some(0));
    assert_eq!(product.sales_count, 1);
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(refunded_order))
        .all(app.db())
        .await
        .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn failed_refund_leaves_the_order_failed() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 5_000, Some(1), 10.0).await;
    let lines = json!([{ "product_id": product.id, "qty": 1 }]);
    let first = app.checkout(seller, lines.clone(), json!({})).await;
    let second = app.checkout(seller, lines, json!({})).await;
    app.payments.fail_refunds();

    let (status, _) = app.complete(first, "pi_ok").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app.complete(second, "pi_short").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["refunded"], false);

    let order_id = Uuid::parse_str(body["order_id"].as_str().unwrap()).unwrap();
    let order = app.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn payment_reference_cannot_settle_two_checkouts() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 3_000, None, 10.0).await;
    let lines = json!([{ "product_id": product.id, "qty": 1 }]);
    let first = app.checkout(seller, lines.clone(), json!({})).await;
    let second = app.checkout(seller, lines, json!({})).await;

    let (status, _) = app.complete(first, "pi_shared").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.complete(second, "pi_shared").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn completion_validates_its_input() {
    let app = TestApp::new().await;

    let (status, _) = app.complete(Uuid::new_v4(), "pi_missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 3_000, None, 10.0).await;
    let intent_id = app
        .checkout(seller, json!([{ "product_id": product.id, "qty": 1 }]), json!({}))
        .await;
    let (status, _) = app.complete(intent_id, "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn explicit_completion_refuses_unpaid_payments() {
    let app = TestApp::new().await;
    let seller = app.seed_seller().await;
    let product = app.seed_product(seller, 10_000, Some(1), 10.0).await;
    let intent_id = app
        .checkout(seller, json!([{ "product_id": product.id, "qty": 1 }]), json!({}))
        .await;
    app.payments.set_payment_status("pi_unpaid", "requires_payment_method");

    let (status, body) = app.complete(intent_id, "pi_unpaid").await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let product = app.product(product.id).await;
    assert_eq!(product.stock_quantity, Some(1));
    assert!(app.earning(seller, EarningRole::Seller).await.is_none());
    let intent = app.state.services.checkout.get_intent(intent_id).await.unwrap();
    assert_eq!(intent.status, IntentStatus::Created);
}
