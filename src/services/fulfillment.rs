//! Funds-gated drop-ship fulfillment.
//!
//! One supplier order row per marketplace order is the idempotency anchor. A
//! row moves `waiting_funds -> pending` through a conditional claim, so two
//! concurrent triggers never both purchase from the supplier.

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, Iterable, QueryFilter, QueryOrder, QuerySelect,
    Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::supplier::{CreateOrderRequest, ShippingAddress, SupplierOrderItem};
use crate::clients::{PaymentProcessor, SupplierApi, SupplierError};
use crate::entities::order::{self, FulfillmentStatus, OrderStatus};
use crate::entities::supplier_order::{self, SupplierOrderStatus};
use crate::entities::{order_item, product, product_variant};
use crate::errors::ServiceError;

static SUPPLIER_STOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)out of stock|backorder|insufficient stock").expect("static regex")
});

/// Outcome of one fulfillment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FulfillmentOutcome {
    /// A supplier order was placed by an earlier attempt
    AlreadyFulfilled { supplier_order_id: Option<String> },
    /// Another attempt holds the claim
    InProgress,
    /// No line of the order maps to a supplier product
    NothingToFulfill,
    WaitingFunds { reason: String },
    /// Supplier temporarily unavailable; the sweep retries
    Deferred { reason: String },
    BlockedInventory { reason: String },
    Submitted { supplier_order_id: Option<String> },
    Failed { reason: String },
}

impl FulfillmentOutcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyFulfilled { .. } | Self::NothingToFulfill | Self::Submitted { .. } => {
                StatusCode::OK
            }
            Self::InProgress | Self::WaitingFunds { .. } | Self::Deferred { .. } => {
                StatusCode::ACCEPTED
            }
            Self::BlockedInventory { .. } => StatusCode::CONFLICT,
            Self::Failed { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::AlreadyFulfilled { .. } => "already_fulfilled",
            Self::InProgress => "in_progress",
            Self::NothingToFulfill => "nothing_to_fulfill",
            Self::WaitingFunds { .. } => "waiting_funds",
            Self::Deferred { .. } => "deferred",
            Self::BlockedInventory { .. } => "blocked_inventory",
            Self::Submitted { .. } => "submitted",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One order line mapped to the supplier catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropshipLine {
    pub pid: String,
    pub vid: Option<String>,
    pub quantity: i32,
    pub unit_cost_cents: i64,
}

impl DropshipLine {
    fn cost_cents(&self) -> i64 {
        self.unit_cost_cents * i64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub examined: u64,
    pub submitted: u64,
    pub waiting: u64,
    pub blocked: u64,
    pub failed: u64,
    pub other: u64,
    /// Abandoned `pending` claims put back in the queue
    pub recovered: u64,
}

fn address_field(address: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| address.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

/// Builds the supplier's shipping block from the processor's address JSON,
/// accepting either `line1/postal_code` or camelCase field names.
pub fn shipping_address(order: &order::Model) -> ShippingAddress {
    let empty = json!({});
    let raw = order.shipping_address.as_ref().unwrap_or(&empty);
    let address = raw.get("address").filter(|a| a.is_object()).unwrap_or(raw);
    let name = order
        .billing_name
        .as_deref()
        .map(str::to_string)
        .or_else(|| raw.get("name").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    let mut parts = name.split_whitespace();
    let first_name = parts.next().unwrap_or_default().to_string();
    let last_name = parts.collect::<Vec<_>>().join(" ");

    ShippingAddress {
        first_name,
        last_name,
        address: address_field(address, &["line1", "address", "addressLine1"]),
        address2: address_field(address, &["line2", "address2", "addressLine2"]),
        city: address_field(address, &["city"]),
        state: address_field(address, &["state", "province"]),
        zip: address_field(address, &["postal_code", "postalCode", "zip"]),
        country: address_field(address, &["country", "countryCode"]).to_uppercase(),
        phone: address_field(raw, &["phone"]),
        email: order.billing_email.clone().unwrap_or_default(),
    }
}

#[derive(Clone)]
pub struct FulfillmentService {
    db_pool: Arc<DatabaseConnection>,
    payments: Arc<dyn PaymentProcessor>,
    supplier: Arc<dyn SupplierApi>,
    logistic_name: String,
    claim_timeout: Duration,
}

impl FulfillmentService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        payments: Arc<dyn PaymentProcessor>,
        supplier: Arc<dyn SupplierApi>,
        logistic_name: String,
        claim_timeout: Duration,
    ) -> Self {
        Self {
            db_pool,
            payments,
            supplier,
            logistic_name,
            claim_timeout,
        }
    }

    /// Attempts to place the supplier purchase for a completed order.
    #[instrument(skip(self))]
    pub async fn fulfill(&self, order_id: Uuid) -> Result<FulfillmentOutcome, ServiceError> {
        self.fulfill_at(order_id, Utc::now()).await
    }

    pub async fn fulfill_at(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let outcome = self.attempt(order_id, now).await?;
        counter!("settlement.fulfillment.attempts", 1, "outcome" => outcome.label());
        info!(%order_id, outcome = outcome.label(), "Fulfillment attempt finished");
        Ok(outcome)
    }

    async fn attempt(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let db = &*self.db_pool;
        let order = order::Entity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if order.status != OrderStatus::Completed {
            return Err(ServiceError::Conflict(format!(
                "order is {} and cannot be fulfilled",
                order.status
            )));
        }

        if let Some(existing) = self.find_supplier_order(order_id).await? {
            if let Some(recorded) = recorded_outcome(&existing) {
                return Ok(recorded);
            }
        }

        let lines = self.dropship_lines(order_id).await?;
        if lines.is_empty() {
            return Ok(FulfillmentOutcome::NothingToFulfill);
        }
        let estimated_cost: i64 = lines.iter().map(DropshipLine::cost_cents).sum();
        self.ensure_anchor(order_id, estimated_cost).await?;

        if let Some(reason) = self.funds_gate(&order, estimated_cost, now).await {
            self.set_order_fulfillment(order_id, FulfillmentStatus::WaitingFunds).await;
            self.note_waiting(order_id, &reason).await;
            return Ok(FulfillmentOutcome::WaitingFunds { reason });
        }

        let claimed = supplier_order::Entity::update_many()
            .col_expr(supplier_order::Column::Status, Expr::value(SupplierOrderStatus::Pending))
            .col_expr(supplier_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(supplier_order::Column::OrderId.eq(order_id))
            .filter(supplier_order::Column::Status.eq(SupplierOrderStatus::WaitingFunds))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;
        if claimed.rows_affected == 0 {
            return Ok(match self.find_supplier_order(order_id).await? {
                Some(row) => recorded_outcome(&row).unwrap_or(FulfillmentOutcome::InProgress),
                None => FulfillmentOutcome::InProgress,
            });
        }

        for line in &lines {
            match self.supplier.inventory(&line.pid, line.vid.as_deref()).await {
                Ok(status) => {
                    if let Some(reason) = status.shortfall(line.quantity) {
                        let reason = format!("{}: {}", line.vid.as_deref().unwrap_or(&line.pid), reason);
                        return self.finish_blocked(&order, reason).await;
                    }
                }
                Err(e) if e.is_transient() => return self.defer(order_id, e).await,
                Err(e) => return self.finish_failed(order_id, e.to_string()).await,
            }
        }

        let request = CreateOrderRequest {
            order_number: supplier_order_number(order_id),
            products: lines
                .iter()
                .map(|l| SupplierOrderItem {
                    pid: l.pid.clone(),
                    vid: l.vid.clone(),
                    quantity: l.quantity,
                })
                .collect(),
            shipping_address: shipping_address(&order),
            logistic_name: self.logistic_name.clone(),
        };

        match self.supplier.create_order(&request).await {
            Ok(supplier_order_id) => {
                let payload = serde_json::to_value(&request).ok();
                supplier_order::Entity::update_many()
                    .col_expr(supplier_order::Column::Status, Expr::value(SupplierOrderStatus::Fulfilled))
                    .col_expr(
                        supplier_order::Column::SupplierOrderId,
                        Expr::value(supplier_order_id.clone()),
                    )
                    .col_expr(supplier_order::Column::Payload, Expr::value(payload))
                    .col_expr(supplier_order::Column::EstimatedCostCents, Expr::value(estimated_cost))
                    .col_expr(supplier_order::Column::ErrorMessage, Expr::value(Option::<String>::None))
                    .col_expr(supplier_order::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(supplier_order::Column::OrderId.eq(order_id))
                    .exec(db)
                    .await
                    .map_err(ServiceError::db_error)?;
                self.set_order_fulfillment(order_id, FulfillmentStatus::Processing).await;
                Ok(FulfillmentOutcome::Submitted { supplier_order_id })
            }
            Err(e) if e.is_transient() => self.defer(order_id, e).await,
            Err(e) => {
                let reason = e.to_string();
                if SUPPLIER_STOCK_RE.is_match(&reason) {
                    self.finish_blocked(&order, reason).await
                } else {
                    self.finish_failed(order_id, reason).await
                }
            }
        }
    }

    /// Re-attempts every order whose supplier purchase is waiting on funds.
    /// Claims left `pending` past the claim timeout are returned to
    /// `waiting_funds` first; the stable supplier order number keeps the
    /// resubmission idempotent on the supplier side.
    #[instrument(skip(self))]
    pub async fn sweep(&self, batch_size: u64) -> Result<SweepSummary, ServiceError> {
        let recovered = self.recover_stale_claims(Utc::now()).await?;
        let waiting = supplier_order::Entity::find()
            .filter(supplier_order::Column::Status.eq(SupplierOrderStatus::WaitingFunds))
            .order_by_asc(supplier_order::Column::UpdatedAt)
            .limit(batch_size)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        let mut summary = SweepSummary {
            examined: waiting.len() as u64,
            recovered,
            ..SweepSummary::default()
        };
        for row in waiting {
            match self.fulfill(row.order_id).await {
                Ok(FulfillmentOutcome::Submitted { .. }) => summary.submitted += 1,
                Ok(FulfillmentOutcome::WaitingFunds { .. }) | Ok(FulfillmentOutcome::Deferred { .. }) => {
                    summary.waiting += 1
                }
                Ok(FulfillmentOutcome::BlockedInventory { .. }) => summary.blocked += 1,
                Ok(FulfillmentOutcome::Failed { .. }) => summary.failed += 1,
                Ok(_) => summary.other += 1,
                Err(e) => {
                    warn!(order_id = %row.order_id, error = %e, "Sweep could not fulfill order");
                    summary.failed += 1;
                }
            }
        }
        info!(
            examined = summary.examined,
            submitted = summary.submitted,
            waiting = summary.waiting,
            "Fulfillment sweep finished"
        );
        Ok(summary)
    }

    pub async fn recover_stale_claims(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let cutoff = now - self.claim_timeout;
        let result = supplier_order::Entity::update_many()
            .col_expr(supplier_order::Column::Status, Expr::value(SupplierOrderStatus::WaitingFunds))
            .col_expr(
                supplier_order::Column::ErrorMessage,
                Expr::value("claim expired before an outcome was recorded".to_string()),
            )
            .col_expr(supplier_order::Column::UpdatedAt, Expr::value(now))
            .filter(supplier_order::Column::Status.eq(SupplierOrderStatus::Pending))
            .filter(supplier_order::Column::SupplierOrderId.is_null())
            .filter(supplier_order::Column::UpdatedAt.lt(cutoff))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected > 0 {
            warn!(recovered = result.rows_affected, "Recovered stale supplier order claims");
        }
        Ok(result.rows_affected)
    }

    async fn find_supplier_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<supplier_order::Model>, ServiceError> {
        supplier_order::Entity::find()
            .filter(supplier_order::Column::OrderId.eq(order_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Lines with a supplier product id, variant mapping preferred over product mapping.
    async fn dropship_lines(&self, order_id: Uuid) -> Result<Vec<DropshipLine>, ServiceError> {
        let db = &*self.db_pool;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let variant_ids: Vec<Uuid> = items.iter().filter_map(|i| i.variant_id).collect();
        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let variants: HashMap<Uuid, product_variant::Model> = product_variant::Entity::find()
            .filter(product_variant::Column::Id.is_in(variant_ids))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        let mut lines = Vec::new();
        for item in items {
            let product = products.get(&item.product_id);
            let variant = item.variant_id.and_then(|id| variants.get(&id));
            let pid = variant
                .and_then(|v| v.cj_product_id.clone())
                .or_else(|| product.and_then(|p| p.cj_product_id.clone()));
            let Some(pid) = pid else {
                debug!(product_id = %item.product_id, "Line has no supplier mapping");
                continue;
            };
            let vid = variant
                .and_then(|v| v.cj_variant_id.clone())
                .or_else(|| product.and_then(|p| p.cj_variant_id.clone()));
            let unit_cost_cents = variant
                .and_then(|v| v.supplier_cost_cents)
                .or_else(|| product.and_then(|p| p.supplier_cost_cents))
                .unwrap_or(0);
            lines.push(DropshipLine {
                pid,
                vid,
                quantity: item.quantity,
                unit_cost_cents,
            });
        }
        Ok(lines)
    }

    async fn ensure_anchor(&self, order_id: Uuid, estimated_cost: i64) -> Result<(), ServiceError> {
        let now = Utc::now();
        let row = supplier_order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            supplier_order_number: Set(supplier_order_number(order_id)),
            supplier_order_id: Set(None),
            status: Set(SupplierOrderStatus::WaitingFunds),
            estimated_cost_cents: Set(Some(estimated_cost)),
            error_message: Set(None),
            supplier_status: Set(None),
            tracking_number: Set(None),
            tracking_url: Set(None),
            payload: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        supplier_order::Entity::insert(row)
            .on_conflict(
                OnConflict::column(supplier_order::Column::OrderId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Reason the purchase must wait, if any.
    async fn funds_gate(
        &self,
        order: &order::Model,
        estimated_cost: i64,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let Some(payment_ref) = order.payment_intent_id.as_deref() else {
            return Some("order has no payment reference".to_string());
        };
        match self.payments.funds_available_on(payment_ref).await {
            Ok(Some(available_on)) if available_on <= now => {}
            Ok(Some(available_on)) => {
                return Some(format!("funds available on {}", available_on.to_rfc3339()))
            }
            Ok(None) => return Some("funds availability not reported yet".to_string()),
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Could not read funds availability");
                return Some("funds availability unknown".to_string());
            }
        }
        match self.payments.available_balance(&order.currency).await {
            Ok(balance) if balance >= estimated_cost => None,
            Ok(balance) => Some(format!(
                "available balance {} below estimated supplier cost {}",
                balance, estimated_cost
            )),
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Could not read platform balance");
                Some("platform balance unknown".to_string())
            }
        }
    }

    async fn note_waiting(&self, order_id: Uuid, reason: &str) {
        let result = supplier_order::Entity::update_many()
            .col_expr(supplier_order::Column::ErrorMessage, Expr::value(reason.to_string()))
            .col_expr(supplier_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(supplier_order::Column::OrderId.eq(order_id))
            .filter(supplier_order::Column::Status.eq(SupplierOrderStatus::WaitingFunds))
            .exec(&*self.db_pool)
            .await;
        if let Err(e) = result {
            warn!(%order_id, error = %e, "Failed to record waiting reason");
        }
    }

    async fn set_order_fulfillment(&self, order_id: Uuid, status: FulfillmentStatus) {
        let mut update = order::Entity::update_many()
            .col_expr(order::Column::FulfillmentStatus, Expr::value(status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id));
        // a supplier shipping update may already have landed
        if status == FulfillmentStatus::Processing {
            update = update.filter(
                order::Column::FulfillmentStatus
                    .is_in(FulfillmentStatus::iter().filter(|s| s.can_advance_to(status))),
            );
        }
        let result = update.exec(&*self.db_pool).await;
        if let Err(e) = result {
            warn!(%order_id, error = %e, "Failed to update order fulfillment status");
        }
    }

    async fn transition(
        &self,
        order_id: Uuid,
        status: SupplierOrderStatus,
        message: Option<String>,
    ) -> Result<(), ServiceError> {
        supplier_order::Entity::update_many()
            .col_expr(supplier_order::Column::Status, Expr::value(status))
            .col_expr(supplier_order::Column::ErrorMessage, Expr::value(message))
            .col_expr(supplier_order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(supplier_order::Column::OrderId.eq(order_id))
            .filter(supplier_order::Column::Status.eq(SupplierOrderStatus::Pending))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn defer(
        &self,
        order_id: Uuid,
        error: SupplierError,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        let reason = error.to_string();
        warn!(%order_id, %reason, "Supplier unavailable; fulfillment deferred");
        self.transition(order_id, SupplierOrderStatus::WaitingFunds, Some(reason.clone()))
            .await?;
        Ok(FulfillmentOutcome::Deferred { reason })
    }

    async fn finish_blocked(
        &self,
        order: &order::Model,
        reason: String,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        warn!(order_id = %order.id, %reason, "Supplier inventory blocks fulfillment");
        self.transition(order.id, SupplierOrderStatus::BlockedInventory, Some(reason.clone()))
            .await?;
        self.set_order_fulfillment(order.id, FulfillmentStatus::BlockedInventory).await;
        Ok(FulfillmentOutcome::BlockedInventory { reason })
    }

    async fn finish_failed(
        &self,
        order_id: Uuid,
        reason: String,
    ) -> Result<FulfillmentOutcome, ServiceError> {
        error!(%order_id, %reason, "Supplier order failed");
        self.transition(order_id, SupplierOrderStatus::Failed, Some(reason.clone()))
            .await?;
        self.set_order_fulfillment(order_id, FulfillmentStatus::Failed).await;
        Ok(FulfillmentOutcome::Failed { reason })
    }
}

pub fn supplier_order_number(order_id: Uuid) -> String {
    format!("BZ-{}", order_id)
}

/// Outcome already settled by an earlier attempt; `None` when the row is
/// still waiting on funds and should be re-evaluated.
fn recorded_outcome(row: &supplier_order::Model) -> Option<FulfillmentOutcome> {
    if row.supplier_order_id.is_some() || row.status == SupplierOrderStatus::Fulfilled {
        return Some(FulfillmentOutcome::AlreadyFulfilled {
            supplier_order_id: row.supplier_order_id.clone(),
        });
    }
    let reason = || row.error_message.clone().unwrap_or_default();
    match row.status {
        SupplierOrderStatus::WaitingFunds => None,
        SupplierOrderStatus::Pending => Some(FulfillmentOutcome::InProgress),
        SupplierOrderStatus::BlockedInventory => {
            Some(FulfillmentOutcome::BlockedInventory { reason: reason() })
        }
        SupplierOrderStatus::Failed => Some(FulfillmentOutcome::Failed { reason: reason() }),
        SupplierOrderStatus::Fulfilled => Some(FulfillmentOutcome::AlreadyFulfilled {
            supplier_order_id: None,
        }),
    }
}
