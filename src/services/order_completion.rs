//! Settlement of a paid checkout intent into an order.
//!
//! Stock is decremented conditionally inside one transaction together with the
//! order claim and its line records, so a failed decrement rolls back every
//! earlier one. The ledger (commissions, recruiter earnings, distributions and
//! balances) is written after commit on a best-effort basis.

use chrono::{Duration, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::PaymentProcessor;
use crate::entities::checkout_intent::{self, IntentStatus};
use crate::entities::commission::{self, CommissionStatus};
use crate::entities::order::{self, FulfillmentStatus, OrderStatus, PaymentStatus};
use crate::entities::payment_distribution::{self, DistributionStatus, RecipientType};
use crate::entities::user_earning::EarningRole;
use crate::entities::{order_item, product, product_variant, profile, recruiter_earning};
use crate::errors::{OutOfStockConflict, ServiceError, StockKind};
use crate::services::checkout_intent::{canonical_lines, CanonicalLineItem};
use crate::services::earnings::{self, BalanceBucket};
use crate::services::fees::{line_affiliate_commission, round_bps, FeeSchedule};

/// Payment confirmation for a checkout intent.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CompletionRequest {
    pub checkout_intent_id: Uuid,
    pub payment_intent_id: String,
    /// Amount the processor reports as charged, when known
    #[serde(default)]
    pub declared_total_cents: Option<i64>,
    #[serde(default)]
    pub billing_email: Option<String>,
    #[serde(default)]
    pub billing_name: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub total_cents: i64,
    /// True when this call found the order already settled
    pub already_processed: bool,
}

impl CompletionResult {
    fn recorded(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            total_cents: order.total_cents,
            already_processed: true,
        }
    }
}

/// Money frozen on one order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettlement {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub seller_amount_cents: i64,
    pub affiliate_commission_cents: i64,
    pub platform_fee_cents: i64,
    pub referral_bonus_cents: i64,
    pub platform_net_cents: i64,
    pub processor_fee_cents: i64,
}

impl LineSettlement {
    fn gross_cents(&self) -> i64 {
        self.seller_amount_cents + self.affiliate_commission_cents + self.platform_fee_cents
    }
}

/// Who receives the referral share of a sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recruiter {
    Fundraiser(Uuid),
    Referrer { recruiter_id: Uuid, recruit_id: Uuid },
}

impl Recruiter {
    fn recipient(&self) -> (Uuid, EarningRole) {
        match *self {
            Self::Fundraiser(id) => (id, EarningRole::Fundraiser),
            Self::Referrer { recruiter_id, .. } => (recruiter_id, EarningRole::Referrer),
        }
    }
}

/// Recomputes every line from the frozen canonical terms and spreads the
/// order's processing fee across lines by gross, remainder on the last line.
pub fn settle_lines(
    fees: &FeeSchedule,
    lines: &[CanonicalLineItem],
    has_affiliate: bool,
    has_recruiter: bool,
    processing_fee_cents: i64,
) -> Vec<LineSettlement> {
    let mut settled: Vec<LineSettlement> = lines
        .iter()
        .map(|line| {
            let seller_amount_cents = line.seller_desired_amount_cents * i64::from(line.qty);
            let affiliate_commission_cents = if has_affiliate {
                line_affiliate_commission(
                    line.commission_type,
                    line.commission_rate,
                    line.flat_commission_cents,
                    seller_amount_cents,
                    line.qty,
                )
            } else {
                0
            };
            let platform_fee_cents =
                round_bps(seller_amount_cents, fees.platform_fee_bps(false)).max(0);
            let referral_bonus_cents = if has_recruiter {
                fees.referral_override_cents(seller_amount_cents, platform_fee_cents)
            } else {
                0
            };
            LineSettlement {
                product_id: line.product_id,
                variant_id: line.variant_id,
                quantity: line.qty,
                unit_price_cents: line.seller_desired_amount_cents,
                seller_amount_cents,
                affiliate_commission_cents,
                platform_fee_cents,
                referral_bonus_cents,
                platform_net_cents: platform_fee_cents - referral_bonus_cents,
                processor_fee_cents: 0,
            }
        })
        .collect();

    let fee = processing_fee_cents.max(0);
    let total_gross: i128 = settled.iter().map(|l| i128::from(l.gross_cents())).sum();
    let last = settled.len().saturating_sub(1);
    let mut allocated = 0i64;
    for (i, line) in settled.iter_mut().enumerate() {
        line.processor_fee_cents = if i == last {
            fee - allocated
        } else if total_gross > 0 {
            (i128::from(fee) * i128::from(line.gross_cents()) / total_gross) as i64
        } else {
            0
        };
        allocated += line.processor_fee_cents;
    }
    settled
}

/// Order-level sums of [`settle_lines`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementTotals {
    pub seller_cents: i64,
    pub affiliate_cents: i64,
    pub platform_fee_cents: i64,
    pub referral_cents: i64,
    pub platform_net_cents: i64,
    pub processor_fee_cents: i64,
}

impl SettlementTotals {
    pub fn of(lines: &[LineSettlement]) -> Self {
        lines.iter().fold(Self::default(), |acc, l| Self {
            seller_cents: acc.seller_cents + l.seller_amount_cents,
            affiliate_cents: acc.affiliate_cents + l.affiliate_commission_cents,
            platform_fee_cents: acc.platform_fee_cents + l.platform_fee_cents,
            referral_cents: acc.referral_cents + l.referral_bonus_cents,
            platform_net_cents: acc.platform_net_cents + l.platform_net_cents,
            processor_fee_cents: acc.processor_fee_cents + l.processor_fee_cents,
        })
    }
}

/// Differences between the recomputed settlement and what the buyer was charged.
pub fn settlement_drift(
    intent: &checkout_intent::Model,
    totals: &SettlementTotals,
    declared_total_cents: Option<i64>,
) -> Vec<(&'static str, i64, i64)> {
    let mut drift = Vec::new();
    let mut check = |field: &'static str, expected: i64, actual: i64| {
        if expected != actual {
            drift.push((field, expected, actual));
        }
    };
    check("product_subtotal", intent.items_subtotal_cents, totals.seller_cents);
    check("affiliate_fee", intent.affiliate_fee_cents, totals.affiliate_cents);
    check(
        "platform_and_referral_fee",
        intent.platform_fee_cents + intent.ref_or_fundraiser_fee_cents,
        totals.platform_fee_cents,
    );
    check("breakdown_total", intent.total_cents, intent.breakdown_sum());
    if let Some(declared) = declared_total_cents {
        check("declared_total", intent.total_cents, declared);
    }
    drift
}

#[derive(Clone)]
pub struct OrderCompletionService {
    db_pool: Arc<DatabaseConnection>,
    payments: Arc<dyn PaymentProcessor>,
    fees: FeeSchedule,
    seller_hold: Duration,
}

impl OrderCompletionService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        payments: Arc<dyn PaymentProcessor>,
        fees: FeeSchedule,
        seller_hold: Duration,
    ) -> Self {
        Self {
            db_pool,
            payments,
            fees,
            seller_hold,
        }
    }

    /// Completion requested by a caller rather than a signed processor event.
    /// The payment must have succeeded at the processor and, when it carries
    /// checkout metadata, belong to this intent.
    #[instrument(skip(self, request), fields(intent_id = %request.checkout_intent_id))]
    pub async fn complete_verified(
        &self,
        mut request: CompletionRequest,
    ) -> Result<CompletionResult, ServiceError> {
        let payment_ref = request.payment_intent_id.trim().to_string();
        if payment_ref.is_empty() {
            return Err(ServiceError::InvalidInput(
                "payment_intent_id is required".to_string(),
            ));
        }
        let payment = self.payments.payment_status(&payment_ref).await?;
        if !payment.succeeded() {
            warn!(status = %payment.status, "Completion requested for an unpaid payment");
            return Err(ServiceError::Conflict(format!(
                "payment {} has status {}",
                payment_ref, payment.status
            )));
        }
        if let Some(claimed) = payment.checkout_intent_id.as_deref() {
            if claimed != request.checkout_intent_id.to_string() {
                return Err(ServiceError::Conflict(
                    "payment belongs to a different checkout".to_string(),
                ));
            }
        }
        if payment.amount_received_cents > 0 {
            request.declared_total_cents = Some(payment.amount_received_cents);
        }
        self.complete(request).await
    }

    /// Settles a paid checkout intent. Safe to call repeatedly for the same payment.
    #[instrument(skip(self, request), fields(intent_id = %request.checkout_intent_id, payment_intent_id = %request.payment_intent_id))]
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult, ServiceError> {
        let payment_ref = request.payment_intent_id.trim().to_string();
        if payment_ref.is_empty() {
            return Err(ServiceError::InvalidInput(
                "payment_intent_id is required".to_string(),
            ));
        }
        let db = &*self.db_pool;

        let intent = checkout_intent::Entity::find_by_id(request.checkout_intent_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Checkout intent {} not found",
                    request.checkout_intent_id
                ))
            })?;
        if let Some(recorded) = intent.provider_payment_intent_id.as_deref() {
            if recorded != payment_ref {
                warn!(recorded, "Payment reference differs from the one recorded on the intent");
            }
        }

        if let Some(existing) = order::Entity::find()
            .filter(order::Column::PaymentIntentId.eq(payment_ref.clone()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
        {
            if existing.checkout_intent_id != intent.id {
                return Err(ServiceError::Conflict(
                    "payment reference already settled another checkout".to_string(),
                ));
            }
            if existing.status != OrderStatus::Pending {
                debug!(order_id = %existing.id, "Payment already settled");
                return Ok(CompletionResult::recorded(&existing));
            }
        }

        let order = self.find_or_create_order(&intent, &payment_ref).await?;
        if order.status != OrderStatus::Pending {
            return Ok(CompletionResult::recorded(&order));
        }

        let lines = canonical_lines(&intent)?;
        let recruiter = self.resolve_recruiter(&intent).await?;
        let settlements = settle_lines(
            &self.fees,
            &lines,
            intent.affiliate_id.is_some(),
            recruiter.is_some(),
            intent.processing_fee_cents,
        );
        let totals = SettlementTotals::of(&settlements);
        for (field, expected, actual) in settlement_drift(&intent, &totals, request.declared_total_cents) {
            counter!("settlement.completions.drift", 1, "field" => field);
            warn!(
                order_id = %order.id,
                field,
                expected,
                actual,
                "Settlement differs from the checkout breakdown"
            );
        }

        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let now = Utc::now();
        let claimed = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Completed))
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(order::Column::PaymentIntentId, Expr::value(payment_ref.clone()))
            .col_expr(order::Column::BillingEmail, Expr::value(request.billing_email.clone()))
            .col_expr(order::Column::BillingName, Expr::value(request.billing_name.clone()))
            .col_expr(order::Column::ShippingAddress, Expr::value(request.shipping_address.clone()))
            .col_expr(order::Column::CompletedAt, Expr::value(now))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if claimed.rows_affected == 0 {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            let current = self.load_order(order.id).await?;
            return Ok(CompletionResult::recorded(&current));
        }

        for line in &lines {
            if let Some((kind, id)) = decrement_stock(&txn, line)
                .await
                .map_err(ServiceError::db_error)?
            {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Err(self.refund_out_of_stock(&order, &payment_ref, kind, id).await);
            }
        }

        let items: Vec<order_item::ActiveModel> = settlements
            .iter()
            .map(|s| order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(s.product_id),
                variant_id: Set(s.variant_id),
                seller_id: Set(intent.seller_id),
                affiliate_id: Set(intent.affiliate_id),
                quantity: Set(s.quantity),
                unit_price_cents: Set(s.unit_price_cents),
                seller_amount_cents: Set(s.seller_amount_cents),
                affiliate_commission_cents: Set(s.affiliate_commission_cents),
                referral_bonus_cents: Set(s.referral_bonus_cents),
                platform_fee_cents: Set(s.platform_fee_cents),
                platform_net_cents: Set(s.platform_net_cents),
                processor_fee_cents: Set(s.processor_fee_cents),
                created_at: Set(now),
            })
            .collect();
        if !items.is_empty() {
            order_item::Entity::insert_many(items)
                .exec_without_returning(&txn)
                .await
                .map_err(ServiceError::db_error)?;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.write_ledger(order.id, &intent, &settlements, recruiter).await;
        self.bump_sales_counts(&lines).await;
        if let Err(e) = checkout_intent::Entity::update_many()
            .col_expr(checkout_intent::Column::Status, Expr::value(IntentStatus::Completed))
            .col_expr(
                checkout_intent::Column::ProviderPaymentIntentId,
                Expr::value(payment_ref.clone()),
            )
            .col_expr(checkout_intent::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(checkout_intent::Column::Id.eq(intent.id))
            .exec(db)
            .await
        {
            warn!(error = %e, "Failed to mark checkout intent completed");
        }

        counter!("settlement.completions.completed", 1);
        info!(
            order_id = %order.id,
            total_cents = order.total_cents,
            lines = settlements.len(),
            "Order completed"
        );
        Ok(CompletionResult {
            order_id: order.id,
            status: OrderStatus::Completed,
            total_cents: order.total_cents,
            already_processed: false,
        })
    }

    /// Records the processor's payment reference on an intent that has none yet.
    #[instrument(skip(self))]
    pub async fn record_payment_reference(
        &self,
        intent_id: Uuid,
        session_id: Option<&str>,
        payment_intent_id: &str,
    ) -> Result<(), ServiceError> {
        let mut update = checkout_intent::Entity::update_many()
            .col_expr(
                checkout_intent::Column::ProviderPaymentIntentId,
                Expr::value(payment_intent_id.to_string()),
            )
            .col_expr(checkout_intent::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(checkout_intent::Column::Id.eq(intent_id))
            .filter(checkout_intent::Column::ProviderPaymentIntentId.is_null());
        if let Some(session_id) = session_id {
            update = update.col_expr(
                checkout_intent::Column::ProviderSessionId,
                Expr::value(session_id.to_string()),
            );
        }
        update
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Finds the intent whose payment reference is `payment_intent_id`.
    pub async fn intent_for_payment(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<checkout_intent::Model>, ServiceError> {
        checkout_intent::Entity::find()
            .filter(checkout_intent::Column::ProviderPaymentIntentId.eq(payment_intent_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Marks an unsettled order and its intent as failed after a declined payment.
    #[instrument(skip(self))]
    pub async fn mark_payment_failed(
        &self,
        payment_intent_id: &str,
        reason: Option<&str>,
    ) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let orders = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Failed))
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Failed))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::PaymentIntentId.eq(payment_intent_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        checkout_intent::Entity::update_many()
            .col_expr(checkout_intent::Column::Status, Expr::value(IntentStatus::Abandoned))
            .col_expr(checkout_intent::Column::UpdatedAt, Expr::value(now))
            .filter(checkout_intent::Column::ProviderPaymentIntentId.eq(payment_intent_id))
            .filter(checkout_intent::Column::Status.eq(IntentStatus::Created))
            .exec(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        warn!(reason = reason.unwrap_or("unknown"), orders = orders.rows_affected, "Payment failed");
        Ok(orders.rows_affected)
    }

    async fn load_order(&self, id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", id)))
    }

    async fn find_or_create_order(
        &self,
        intent: &checkout_intent::Model,
        payment_ref: &str,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let by_intent = || {
            order::Entity::find()
                .filter(order::Column::CheckoutIntentId.eq(intent.id))
                .one(db)
        };
        if let Some(order) = by_intent().await.map_err(ServiceError::db_error)? {
            return Ok(order);
        }

        let now = Utc::now();
        let inserted = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            checkout_intent_id: Set(intent.id),
            seller_id: Set(intent.seller_id),
            buyer_id: Set(intent.buyer_id),
            affiliate_id: Set(intent.affiliate_id),
            referrer_id: Set(intent.referrer_id),
            fundraiser_id: Set(intent.fundraiser_id),
            currency: Set(intent.currency.clone()),
            items_subtotal_cents: Set(intent.items_subtotal_cents),
            shipping_cents: Set(intent.shipping_cents),
            tax_cents: Set(intent.tax_cents),
            affiliate_fee_cents: Set(intent.affiliate_fee_cents),
            platform_fee_cents: Set(intent.platform_fee_cents),
            ref_or_fundraiser_fee_cents: Set(intent.ref_or_fundraiser_fee_cents),
            processing_fee_cents: Set(intent.processing_fee_cents),
            total_cents: Set(intent.total_cents),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            payment_intent_id: Set(Some(payment_ref.to_string())),
            billing_email: Set(None),
            billing_name: Set(None),
            shipping_address: Set(None),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await;

        match inserted {
            Ok(order) => Ok(order),
            Err(insert_err) => match by_intent().await.map_err(ServiceError::db_error)? {
                // a concurrent delivery created it first
                Some(order) => Ok(order),
                None => Err(ServiceError::db_error(insert_err)),
            },
        }
    }

    async fn resolve_recruiter(
        &self,
        intent: &checkout_intent::Model,
    ) -> Result<Option<Recruiter>, ServiceError> {
        if let Some(fundraiser_id) = intent.fundraiser_id {
            return Ok(Some(Recruiter::Fundraiser(fundraiser_id)));
        }
        let owner = intent.affiliate_id.unwrap_or(intent.seller_id);
        let recruiter_id = match intent.referrer_id {
            Some(id) => Some(id),
            None => profile::Entity::find_by_id(owner)
                .one(&*self.db_pool)
                .await
                .map_err(ServiceError::db_error)?
                .and_then(|p| p.referred_by_affiliate_id),
        };
        Ok(recruiter_id
            .filter(|id| *id != owner)
            .map(|recruiter_id| Recruiter::Referrer {
                recruiter_id,
                recruit_id: owner,
            }))
    }

    async fn refund_out_of_stock(
        &self,
        order: &order::Model,
        payment_ref: &str,
        kind: StockKind,
        id: Uuid,
    ) -> ServiceError {
        let idempotency_key = format!("oos-refund-{}", order.id);
        let refunded = match self.payments.refund(payment_ref, &idempotency_key).await {
            Ok(refund) => {
                info!(order_id = %order.id, refund_id = %refund.id, "Refunded sale that ran out of stock");
                true
            }
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Refund after stock shortfall failed");
                false
            }
        };

        let (status, payment_status, fulfillment_status) = if refunded {
            (OrderStatus::Refunded, PaymentStatus::Refunded, FulfillmentStatus::Refunded)
        } else {
            (OrderStatus::Failed, PaymentStatus::Paid, FulfillmentStatus::Failed)
        };
        if let Err(e) = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(status))
            .col_expr(order::Column::PaymentStatus, Expr::value(payment_status))
            .col_expr(order::Column::FulfillmentStatus, Expr::value(fulfillment_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&*self.db_pool)
            .await
        {
            error!(order_id = %order.id, error = %e, "Failed to record stock shortfall on order");
        }

        counter!("settlement.completions.out_of_stock", 1, "refunded" => refunded.to_string());
        warn!(order_id = %order.id, kind = %kind, stock_id = %id, refunded, "Stock exhausted at settlement");
        ServiceError::OutOfStock(OutOfStockConflict {
            kind,
            id,
            refunded,
            order_id: Some(order.id),
        })
    }

    /// Commissions, recruiter earnings, distributions and balance credits.
    /// Each write is independent; failures are logged and skipped.
    async fn write_ledger(
        &self,
        order_id: Uuid,
        intent: &checkout_intent::Model,
        settlements: &[LineSettlement],
        recruiter: Option<Recruiter>,
    ) {
        let db = &*self.db_pool;
        let now = Utc::now();
        let totals = SettlementTotals::of(settlements);

        if let Some(affiliate_id) = intent.affiliate_id {
            let mut per_product: BTreeMap<Uuid, i64> = BTreeMap::new();
            for s in settlements.iter().filter(|s| s.affiliate_commission_cents > 0) {
                *per_product.entry(s.product_id).or_default() += s.affiliate_commission_cents;
            }
            for (product_id, amount_cents) in per_product {
                let row = commission::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    affiliate_id: Set(affiliate_id),
                    order_id: Set(order_id),
                    product_id: Set(product_id),
                    amount_cents: Set(amount_cents),
                    status: Set(CommissionStatus::Pending),
                    created_at: Set(now),
                };
                if let Err(e) = commission::Entity::insert(row).exec_without_returning(db).await {
                    warn!(%order_id, %product_id, error = %e, "Failed to record commission");
                }
            }
        }

        if let Some(Recruiter::Referrer { recruiter_id, recruit_id }) = recruiter {
            if totals.referral_cents > 0 {
                let row = recruiter_earning::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    recruiter_id: Set(recruiter_id),
                    recruit_id: Set(recruit_id),
                    order_id: Set(order_id),
                    amount_cents: Set(totals.referral_cents),
                    created_at: Set(now),
                };
                if let Err(e) = recruiter_earning::Entity::insert(row).exec_without_returning(db).await {
                    warn!(%order_id, error = %e, "Failed to record recruiter earning");
                }
            }
        }

        let mut distributions = vec![(
            RecipientType::Seller,
            Some(intent.seller_id),
            totals.seller_cents,
            DistributionStatus::Held,
            Some(now + self.seller_hold),
        )];
        if let Some(affiliate_id) = intent.affiliate_id {
            distributions.push((
                RecipientType::Affiliate,
                Some(affiliate_id),
                totals.affiliate_cents,
                DistributionStatus::Pending,
                None,
            ));
        }
        if let Some(recruiter) = recruiter {
            distributions.push((
                RecipientType::Referral,
                Some(recruiter.recipient().0),
                totals.referral_cents,
                DistributionStatus::Pending,
                None,
            ));
        }
        distributions.push((
            RecipientType::Platform,
            None,
            totals.platform_net_cents,
            DistributionStatus::Pending,
            None,
        ));

        for (recipient_type, recipient_id, amount_cents, status, available_at) in distributions {
            if amount_cents <= 0 {
                continue;
            }
            let row = payment_distribution::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                recipient_type: Set(recipient_type),
                recipient_id: Set(recipient_id),
                amount_cents: Set(amount_cents),
                status: Set(status),
                available_at: Set(available_at),
                released_at: Set(None),
                created_at: Set(now),
            };
            if let Err(e) = payment_distribution::Entity::insert(row).exec_without_returning(db).await {
                warn!(%order_id, recipient = %recipient_type, error = %e, "Failed to record distribution");
            }
        }

        let mut credits = vec![(intent.seller_id, EarningRole::Seller, totals.seller_cents, BalanceBucket::Held)];
        if let Some(affiliate_id) = intent.affiliate_id {
            credits.push((affiliate_id, EarningRole::Affiliate, totals.affiliate_cents, BalanceBucket::Current));
        }
        if let Some(recruiter) = recruiter {
            let (user_id, role) = recruiter.recipient();
            credits.push((user_id, role, totals.referral_cents, BalanceBucket::Current));
        }
        for (user_id, role, amount_cents, bucket) in credits {
            if let Err(e) = earnings::credit(db, user_id, role, amount_cents, bucket).await {
                warn!(%order_id, %user_id, role = %role, error = %e, "Failed to credit earnings");
            }
        }
    }

    async fn bump_sales_counts(&self, lines: &[CanonicalLineItem]) {
        let mut per_product: BTreeMap<Uuid, i32> = BTreeMap::new();
        for line in lines {
            *per_product.entry(line.product_id).or_default() += line.qty;
        }
        for (product_id, qty) in per_product {
            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::SalesCount,
                    Expr::col(product::Column::SalesCount).add(qty),
                )
                .filter(product::Column::Id.eq(product_id))
                .exec(&*self.db_pool)
                .await;
            if let Err(e) = result {
                warn!(%product_id, error = %e, "Failed to update sales count");
            }
        }
    }
}

/// Conditionally decrements the stock counter a line draws from. Returns the
/// counter that could not cover the quantity, if any. Untracked stock is skipped.
async fn decrement_stock(
    txn: &DatabaseTransaction,
    line: &CanonicalLineItem,
) -> Result<Option<(StockKind, Uuid)>, DbErr> {
    if let Some(variant_id) = line.variant_id {
        let tracked = product_variant::Entity::find_by_id(variant_id)
            .one(txn)
            .await?
            .map(|v| v.stock_quantity.is_some())
            .unwrap_or(false);
        if tracked {
            let result = product_variant::Entity::update_many()
                .col_expr(
                    product_variant::Column::StockQuantity,
                    Expr::col(product_variant::Column::StockQuantity).sub(line.qty),
                )
                .filter(product_variant::Column::Id.eq(variant_id))
                .filter(product_variant::Column::StockQuantity.gte(line.qty))
                .exec(txn)
                .await?;
            return Ok((result.rows_affected == 0).then_some((StockKind::Variant, variant_id)));
        }
    }

    let tracked = product::Entity::find_by_id(line.product_id)
        .one(txn)
        .await?
        .map(|p| p.stock_quantity.is_some())
        .unwrap_or(false);
    if !tracked {
        return Ok(None);
    }
    let result = product::Entity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(line.qty),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product::Column::Id.eq(line.product_id))
        .filter(product::Column::StockQuantity.gte(line.qty))
        .exec(txn)
        .await?;
    Ok((result.rows_affected == 0).then_some((StockKind::Product, line.product_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::product::CommissionType;
    use proptest::prelude::*;

    fn line(ask: i64, qty: i32, rate: f64) -> CanonicalLineItem {
        CanonicalLineItem {
            product_id: Uuid::new_v4(),
            variant_id: None,
            name: "Item".into(),
            qty,
            unit_price_cents: ask,
            seller_desired_amount_cents: ask,
            commission_type: CommissionType::Percentage,
            commission_rate: rate,
            flat_commission_cents: 0,
            affiliate_commission_cents: 0,
        }
    }

    #[test]
    fn single_line_matches_worked_example() {
        let fees = FeeSchedule::default();
        let settled = settle_lines(&fees, &[line(10_000, 1, 10.0)], true, false, 405);
        let s = settled[0];
        assert_eq!(s.seller_amount_cents, 10_000);
        assert_eq!(s.affiliate_commission_cents, 1_000);
        assert_eq!(s.platform_fee_cents, 1_500);
        assert_eq!(s.referral_bonus_cents, 0);
        assert_eq!(s.platform_net_cents, 1_500);
        assert_eq!(s.processor_fee_cents, 405);
    }

    #[test]
    fn recruiter_override_comes_out_of_platform_fee() {
        let fees = FeeSchedule::default();
        let s = settle_lines(&fees, &[line(10_000, 1, 0.0)], false, true, 0)[0];
        assert_eq!(s.platform_fee_cents, 1_500);
        assert_eq!(s.referral_bonus_cents, 500);
        assert_eq!(s.platform_net_cents, 1_000);
    }

    #[test]
    fn processing_fee_remainder_lands_on_last_line() {
        let fees = FeeSchedule::default();
        let lines = [line(1_000, 1, 0.0), line(1_000, 1, 0.0), line(1_000, 1, 0.0)];
        let settled = settle_lines(&fees, &lines, false, false, 100);
        let fees_per_line: Vec<i64> = settled.iter().map(|s| s.processor_fee_cents).collect();
        assert_eq!(fees_per_line, vec![33, 33, 34]);
    }

    #[test]
    fn no_affiliate_means_no_commission() {
        let fees = FeeSchedule::default();
        let s = settle_lines(&fees, &[line(2_000, 2, 20.0)], false, false, 0)[0];
        assert_eq!(s.seller_amount_cents, 4_000);
        assert_eq!(s.affiliate_commission_cents, 0);
    }

    proptest! {
        #[test]
        fn allocation_preserves_the_processing_fee(
            asks in proptest::collection::vec((1i64..100_000, 1i32..5), 1..8),
            fee in 0i64..100_000,
        ) {
            let fees = FeeSchedule::default();
            let lines: Vec<CanonicalLineItem> = asks.iter().map(|(a, q)| line(*a, *q, 10.0)).collect();
            let settled = settle_lines(&fees, &lines, true, true, fee);
            let totals = SettlementTotals::of(&settled);
            prop_assert_eq!(totals.processor_fee_cents, fee);
            prop_assert!(settled.iter().all(|s| s.processor_fee_cents >= 0));
            prop_assert_eq!(totals.platform_net_cents + totals.referral_cents, totals.platform_fee_cents);
            prop_assert!(settled.iter().all(|s| s.referral_bonus_cents <= s.platform_fee_cents));
        }
    }
}
