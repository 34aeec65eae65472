#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use reqwest::Method as SupplierMethod;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use marketplace_settlement::{
    app_router,
    clients::payment_processor::{
        CheckoutSession, CheckoutSessionRequest, PaymentIntentStatus, PaymentProcessorError,
        Refund, Transfer, TransferRequest,
    },
    clients::supplier::{CreateOrderRequest, InventoryStatus, ProxyResponse},
    clients::{PaymentProcessor, SupplierApi, SupplierClient, SupplierError},
    config::AppConfig,
    db,
    entities::product::{self, CommissionType},
    entities::user_earning::{self, EarningRole},
    entities::{order, product_variant, profile, supplier_order},
    AppState,
};

pub const JOB_TOKEN: &str = "test-job-token";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// What the fake processor has been asked to do, and how it should answer.
#[derive(Debug, Default)]
pub struct PaymentsState {
    pub sessions: Vec<CheckoutSessionRequest>,
    pub refunds: Vec<(String, String)>,
    pub transfers: Vec<TransferRequest>,
    pub funds_available_on: Option<DateTime<Utc>>,
    pub balance_cents: i64,
    pub fail_sessions: bool,
    pub fail_refunds: bool,
    pub failing_destinations: HashSet<String>,
    /// Payment intents reported with a status other than `succeeded`
    pub payment_statuses: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct FakePayments {
    pub state: Mutex<PaymentsState>,
}

impl FakePayments {
    fn lock(&self) -> std::sync::MutexGuard<'_, PaymentsState> {
        self.state.lock().unwrap()
    }

    pub fn funds_settled(&self, balance_cents: i64) {
        let mut state = self.lock();
        state.funds_available_on = Some(Utc::now() - chrono::Duration::days(1));
        state.balance_cents = balance_cents;
    }

    pub fn funds_pending(&self) {
        let mut state = self.lock();
        state.funds_available_on = Some(Utc::now() + chrono::Duration::days(2));
    }

    pub fn fail_transfers_to(&self, destination: &str) {
        self.lock().failing_destinations.insert(destination.to_string());
    }

    pub fn set_payment_status(&self, payment_intent_id: &str, status: &str) {
        self.lock()
            .payment_statuses
            .insert(payment_intent_id.to_string(), status.to_string());
    }

    pub fn fail_refunds(&self) {
        self.lock().fail_refunds = true;
    }

    pub fn fail_sessions(&self) {
        self.lock().fail_sessions = true;
    }

    pub fn sessions(&self) -> Vec<CheckoutSessionRequest> {
        self.lock().sessions.clone()
    }

    pub fn refunds(&self) -> Vec<(String, String)> {
        self.lock().refunds.clone()
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.lock().transfers.clone()
    }
}

#[async_trait]
impl PaymentProcessor for FakePayments {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentProcessorError> {
        let mut state = self.lock();
        if state.fail_sessions {
            return Err(PaymentProcessorError::Api {
                status: 500,
                message: "session creation unavailable".to_string(),
            });
        }
        state.sessions.push(request.clone());
        let id = format!("cs_test_{}", state.sessions.len());
        Ok(CheckoutSession {
            url: format!("https://checkout.test/pay/{}", id),
            id,
        })
    }

    async fn refund(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<Refund, PaymentProcessorError> {
        let mut state = self.lock();
        if state.fail_refunds {
            return Err(PaymentProcessorError::Api {
                status: 402,
                message: "refund declined".to_string(),
            });
        }
        state
            .refunds
            .push((payment_intent_id.to_string(), idempotency_key.to_string()));
        Ok(Refund {
            id: format!("re_test_{}", state.refunds.len()),
            status: "succeeded".to_string(),
        })
    }

    async fn payment_status(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentStatus, PaymentProcessorError> {
        let status = self
            .lock()
            .payment_statuses
            .get(payment_intent_id)
            .cloned()
            .unwrap_or_else(|| "succeeded".to_string());
        Ok(PaymentIntentStatus {
            status,
            amount_received_cents: 0,
            checkout_intent_id: None,
        })
    }

    async fn funds_available_on(
        &self,
        _payment_intent_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PaymentProcessorError> {
        Ok(self.lock().funds_available_on)
    }

    async fn available_balance(&self, _currency: &str) -> Result<i64, PaymentProcessorError> {
        Ok(self.lock().balance_cents)
    }

    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<Transfer, PaymentProcessorError> {
        let mut state = self.lock();
        if state.failing_destinations.contains(&request.destination_account) {
            return Err(PaymentProcessorError::Api {
                status: 400,
                message: "destination account cannot receive transfers".to_string(),
            });
        }
        state.transfers.push(request.clone());
        Ok(Transfer {
            id: format!("tr_test_{}", state.transfers.len()),
        })
    }
}

/// How the fake supplier answers `create_order`.
#[derive(Debug, Clone, Default)]
pub enum CreateOrderMode {
    #[default]
    Accept,
    RateLimited,
    Reject(String),
}

#[derive(Debug, Default)]
pub struct SupplierState {
    pub stock: Option<i64>,
    pub backorder: bool,
    pub create_mode: CreateOrderMode,
    pub inventory_checks: Vec<(String, Option<String>)>,
    pub orders: Vec<CreateOrderRequest>,
}

#[derive(Debug, Default)]
pub struct FakeSupplier {
    pub state: Mutex<SupplierState>,
}

impl FakeSupplier {
    fn lock(&self) -> std::sync::MutexGuard<'_, SupplierState> {
        self.state.lock().unwrap()
    }

    pub fn set_stock(&self, stock: Option<i64>) {
        self.lock().stock = stock;
    }

    pub fn set_create_mode(&self, mode: CreateOrderMode) {
        self.lock().create_mode = mode;
    }

    pub fn orders(&self) -> Vec<CreateOrderRequest> {
        self.lock().orders.clone()
    }
}

#[async_trait]
impl SupplierApi for FakeSupplier {
    async fn inventory(&self, pid: &str, vid: Option<&str>) -> Result<InventoryStatus, SupplierError> {
        let mut state = self.lock();
        state
            .inventory_checks
            .push((pid.to_string(), vid.map(str::to_string)));
        Ok(InventoryStatus {
            stock: state.stock,
            backorder: state.backorder,
        })
    }

    async fn create_order(&self, order: &CreateOrderRequest) -> Result<Option<String>, SupplierError> {
        let mut state = self.lock();
        match state.create_mode.clone() {
            CreateOrderMode::Accept => {
                state.orders.push(order.clone());
                Ok(Some(format!("CJ{}", state.orders.len())))
            }
            CreateOrderMode::RateLimited => Err(SupplierError::RateLimited {
                retry_after: std::time::Duration::from_secs(300),
            }),
            CreateOrderMode::Reject(message) => Err(SupplierError::Api {
                status: 200,
                message,
            }),
        }
    }

    async fn proxy(
        &self,
        endpoint: &str,
        method: SupplierMethod,
        body: Value,
    ) -> Result<ProxyResponse, SupplierError> {
        Ok(ProxyResponse {
            status: reqwest::StatusCode::OK,
            body: json!({ "endpoint": endpoint, "method": method.as_str(), "echo": body }),
        })
    }
}

/// Application wired to a throwaway SQLite file and in-memory fakes.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub payments: Arc<FakePayments>,
    pub supplier: Arc<FakeSupplier>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(adjust, false).await
    }

    /// Builds the app with the real supplier client pointed at `supplier_url`.
    pub async fn with_supplier_server(supplier_url: &str) -> Self {
        let url = supplier_url.to_string();
        Self::build(
            move |cfg| {
                cfg.supplier.base_url = url;
                cfg.supplier.api_key = Some("cj-test-key".to_string());
                cfg.supplier.min_request_interval_ms = 1;
            },
            true,
        )
        .await
    }

    async fn build(adjust: impl FnOnce(&mut AppConfig), live_supplier: bool) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("settlement.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payments.webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.jobs.job_token = Some(JOB_TOKEN.to_string());
        adjust(&mut cfg);

        let pool = Arc::new(
            db::establish_connection_from_app_config(&cfg)
                .await
                .expect("failed to create test database"),
        );
        db::run_migrations(&pool).await.expect("migrations");

        let payments = Arc::new(FakePayments::default());
        let supplier = Arc::new(FakeSupplier::default());
        let supplier_api: Arc<dyn SupplierApi> = if live_supplier {
            Arc::new(SupplierClient::new(&cfg.supplier, Some(pool.clone())).expect("supplier client"))
        } else {
            supplier.clone()
        };
        let state = AppState::new(pool, Arc::new(cfg), payments.clone(), supplier_api);

        Self {
            router: app_router(state.clone()),
            state,
            payments,
            supplier,
            _dir: dir,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.request_with_headers(method, uri, body.map(|b| b.to_string()), &[])
            .await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<String>,
        headers: &[(&str, String)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        let request = builder
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .expect("request");

        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    pub async fn seed_profile(
        &self,
        role: &str,
        payment_account: Option<&str>,
        fully_verified: bool,
        referred_by: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let verified = fully_verified.then(|| "verified".to_string());
        profile::ActiveModel {
            id: Set(id),
            role: Set(role.to_string()),
            full_name: Set(Some(format!("{} {}", role, &id.to_string()[..8]))),
            email: Set(Some(format!("{}@example.test", &id.to_string()[..8]))),
            payment_account_id: Set(payment_account.map(str::to_string)),
            payment_account_status: Set(payment_account.map(|_| "verified".to_string())),
            seller_verification_status: Set(verified.clone()),
            identity_verification_status: Set(verified),
            referred_by_affiliate_id: Set(referred_by),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed profile");
        id
    }

    /// A seller with a verified payout account.
    pub async fn seed_seller(&self) -> Uuid {
        let account = format!("acct_seller_{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.seed_profile("seller", Some(&account), true, None).await
    }

    pub async fn seed_affiliate(&self, referred_by: Option<Uuid>) -> Uuid {
        let account = format!("acct_aff_{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.seed_profile("affiliate", Some(&account), true, referred_by)
            .await
    }

    pub async fn seed_product(
        &self,
        seller_id: Uuid,
        ask_cents: i64,
        stock: Option<i32>,
        commission_rate: f64,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            seller_id: Set(seller_id),
            title: Set("Enamel mug".to_string()),
            seller_ask_cents: Set(ask_cents),
            commission_type: Set(CommissionType::Percentage),
            commission_rate: Set(commission_rate),
            flat_commission_cents: Set(0),
            stock_quantity: Set(stock),
            is_active: Set(true),
            is_promotable: Set(true),
            sales_count: Set(0),
            cj_product_id: Set(None),
            cj_variant_id: Set(None),
            supplier_cost_cents: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product")
    }

    /// A product with one drop-ship variant mapped to the supplier catalogue.
    pub async fn seed_dropship_product(
        &self,
        seller_id: Uuid,
        price_cents: i64,
        supplier_cost_cents: i64,
    ) -> (product::Model, product_variant::Model) {
        let product = self.seed_product(seller_id, price_cents, None, 10.0).await;
        let variant = product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            title: Set("Blue".to_string()),
            price_cents: Set(price_cents),
            stock_quantity: Set(None),
            is_active: Set(true),
            cj_product_id: Set(Some("CJ-PID-1".to_string())),
            cj_variant_id: Set(Some("CJ-VID-BLUE".to_string())),
            supplier_cost_cents: Set(Some(supplier_cost_cents)),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed variant");
        (product, variant)
    }

    pub async fn set_balance(&self, user_id: Uuid, role: EarningRole, current_cents: i64) {
        let now = Utc::now();
        user_earning::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            role: Set(role),
            held_balance_cents: Set(0),
            current_balance_cents: Set(current_cents),
            pending_payout_cents: Set(0),
            total_earned_cents: Set(current_cents),
            paid_out_cents: Set(0),
            last_payout_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed balance");
    }

    /// Creates a checkout through the API and returns the intent id.
    pub async fn checkout(&self, seller_id: Uuid, lines: Value, context: Value) -> Uuid {
        let mut ctx = json!({ "seller_id": seller_id });
        if let (Some(target), Some(extra)) = (ctx.as_object_mut(), context.as_object()) {
            target.extend(extra.clone());
        }
        let (status, body) = self
            .request(
                Method::POST,
                "/api/v1/checkout",
                Some(json!({
                    "cart": { "line_items": lines, "currency": "usd" },
                    "context": ctx,
                    "success_url": "https://shop.test/success",
                    "cancel_url": "https://shop.test/cancel",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "checkout failed: {body}");
        body["checkout_intent_id"]
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .expect("checkout_intent_id")
    }

    pub async fn complete(&self, intent_id: Uuid, payment_intent_id: &str) -> (StatusCode, Value) {
        self.request_with_headers(
            Method::POST,
            "/api/v1/orders/complete",
            Some(json!({
                "checkoutIntentId": intent_id,
                "paymentIntentId": payment_intent_id,
                "billingEmail": "buyer@example.test",
                "billingName": "Ada Lovelace",
                "shippingAddress": {
                    "line1": "1 Market St",
                    "city": "San Francisco",
                    "state": "CA",
                    "postal_code": "94105",
                    "country": "us"
                }
            })
            .to_string()),
            &[("x-caller-id", Uuid::new_v4().to_string())],
        )
        .await
    }

    /// Checkout plus completion; returns the settled order id.
    pub async fn paid_order(&self, seller_id: Uuid, lines: Value, payment_intent_id: &str) -> Uuid {
        let intent_id = self.checkout(seller_id, lines, json!({})).await;
        let (status, body) = self.complete(intent_id, payment_intent_id).await;
        assert_eq!(status, StatusCode::OK, "completion failed: {body}");
        body["data"]["order_id"]
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .expect("order_id")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(self.db())
            .await
            .expect("query product")
            .expect("product exists")
    }

    pub async fn supplier_order(&self, order_id: Uuid) -> Option<supplier_order::Model> {
        use sea_orm::{ColumnTrait, QueryFilter};
        supplier_order::Entity::find()
            .filter(supplier_order::Column::OrderId.eq(order_id))
            .one(self.db())
            .await
            .expect("query supplier order")
    }

    pub async fn earning(&self, user_id: Uuid, role: EarningRole) -> Option<user_earning::Model> {
        use sea_orm::{ColumnTrait, QueryFilter};
        user_earning::Entity::find()
            .filter(user_earning::Column::UserId.eq(user_id))
            .filter(user_earning::Column::Role.eq(role))
            .one(self.db())
            .await
            .expect("query earnings")
    }
}
