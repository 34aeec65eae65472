//! Server-priced checkout intents.
//!
//! A checkout request is validated against catalog and profile state, priced
//! with [`FeeSchedule`], stored as an immutable intent and turned into a hosted
//! checkout session. Client-supplied prices are never used.

use chrono::Utc;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clients::payment_processor::{CheckoutSessionRequest, SessionLineItem};
use crate::clients::PaymentProcessor;
use crate::entities::checkout_intent::{self, IntentStatus};
use crate::entities::product::{self, CommissionType};
use crate::entities::{product_variant, profile};
use crate::errors::{CheckoutErrorCode, CheckoutRejection, ServiceError};
use crate::services::fees::{line_affiliate_commission, FeeSchedule, FeeSplitError, SplitInput};

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("static regex")
});

/// Whether a variant reference should be resolved by primary key.
pub fn looks_like_uuid(raw: &str) -> bool {
    UUID_RE.is_match(raw.trim())
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CartLineInput {
    pub product_id: Uuid,
    /// Variant primary key or supplier variant id
    #[serde(default)]
    pub variant_id: Option<String>,
    pub qty: i32,
    /// Accepted for compatibility and ignored
    #[serde(default)]
    pub unit_price_cents: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CartInput {
    pub line_items: Vec<CartLineInput>,
    #[serde(default, alias = "shipping_amount")]
    #[validate(range(min = 0))]
    pub shipping_cents: i64,
    #[serde(default, alias = "tax_amount")]
    #[validate(range(min = 0))]
    pub tax_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CheckoutContext {
    pub seller_id: Uuid,
    #[serde(default)]
    pub buyer_id: Option<Uuid>,
    #[serde(default)]
    pub store_id: Option<Uuid>,
    #[serde(default)]
    pub affiliate_id: Option<Uuid>,
    #[serde(default)]
    pub referrer_id: Option<Uuid>,
    #[serde(default)]
    pub fundraiser_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateCheckoutRequest {
    #[validate]
    pub cart: CartInput,
    pub context: CheckoutContext,
    #[validate(url)]
    pub success_url: String,
    #[validate(url)]
    pub cancel_url: String,
}

/// A cart line as priced by the server, frozen on the intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalLineItem {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub qty: i32,
    pub unit_price_cents: i64,
    /// Seller's unit ask at checkout time
    pub seller_desired_amount_cents: i64,
    pub commission_type: CommissionType,
    pub commission_rate: f64,
    pub flat_commission_cents: i64,
    /// Zero when no affiliate is attributed
    pub affiliate_commission_cents: i64,
}

impl CanonicalLineItem {
    pub fn line_subtotal_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.qty)
    }
}

/// Decodes the canonical lines stored on an intent.
pub fn canonical_lines(intent: &checkout_intent::Model) -> Result<Vec<CanonicalLineItem>, ServiceError> {
    serde_json::from_value(intent.line_items.clone()).map_err(|e| {
        ServiceError::InternalError(format!(
            "checkout intent {} has unreadable line items: {}",
            intent.id, e
        ))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutCreated {
    pub url: String,
    pub checkout_intent_id: Uuid,
}

/// Read model for the intent inspection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentBreakdown {
    pub id: Uuid,
    pub status: IntentStatus,
    pub currency: String,
    pub split_version: String,
    pub product_subtotal_cents: i64,
    pub affiliate_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub ref_or_fundraiser_fee_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub processing_fee_cents: i64,
    pub seller_transfer_cents: i64,
    pub total_cents: i64,
    pub affiliate_rate_bps: Option<i32>,
    pub line_items: serde_json::Value,
}

impl From<checkout_intent::Model> for IntentBreakdown {
    fn from(m: checkout_intent::Model) -> Self {
        Self {
            id: m.id,
            status: m.status,
            currency: m.currency,
            split_version: m.split_version,
            product_subtotal_cents: m.items_subtotal_cents,
            affiliate_fee_cents: m.affiliate_fee_cents,
            platform_fee_cents: m.platform_fee_cents,
            ref_or_fundraiser_fee_cents: m.ref_or_fundraiser_fee_cents,
            shipping_cents: m.shipping_cents,
            tax_cents: m.tax_cents,
            processing_fee_cents: m.processing_fee_cents,
            seller_transfer_cents: m.seller_transfer_cents,
            total_cents: m.total_cents,
            affiliate_rate_bps: m.affiliate_rate_bps,
            line_items: m.line_items,
        }
    }
}

/// Parties attributed to a checkout after profile resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attribution {
    affiliate_id: Option<Uuid>,
    referrer_id: Option<Uuid>,
    fundraiser_id: Option<Uuid>,
}

fn reject(code: CheckoutErrorCode, message: impl Into<String>) -> ServiceError {
    CheckoutRejection::new(code, message).into()
}

/// Upper-case ISO 4217 style code.
pub fn normalize_currency(raw: &str) -> Result<String, ServiceError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() == 3 && code.bytes().all(|b| b.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(reject(
            CheckoutErrorCode::InvalidCurrency,
            format!("invalid currency `{}`", raw),
        ))
    }
}

/// Rate in basis points when every percentage line shares one rate.
fn uniform_rate_bps(lines: &[CanonicalLineItem]) -> Option<i32> {
    let mut rates = lines
        .iter()
        .filter(|l| l.commission_type == CommissionType::Percentage)
        .map(|l| (l.commission_rate * 1000.0).round() as i64);
    let first = rates.next()?;
    if rates.all(|r| r == first) {
        Some(((first as f64 / 1000.0) * 100.0).round() as i32)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DatabaseConnection>,
    payments: Arc<dyn PaymentProcessor>,
    fees: FeeSchedule,
    split_version: String,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        payments: Arc<dyn PaymentProcessor>,
        fees: FeeSchedule,
        split_version: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            payments,
            fees,
            split_version: split_version.into(),
        }
    }

    /// Validates and prices a cart, stores the intent and opens a hosted checkout session.
    #[instrument(skip(self, request), fields(seller_id = %request.context.seller_id, lines = request.cart.line_items.len()))]
    pub async fn create_checkout(
        &self,
        request: CreateCheckoutRequest,
    ) -> Result<CheckoutCreated, ServiceError> {
        request.validate()?;
        if request.cart.line_items.is_empty() {
            return Err(reject(CheckoutErrorCode::EmptyCart, "cart.line_items is required"));
        }
        let currency = normalize_currency(&request.cart.currency)?;
        let context = &request.context;

        let mut lines = self.resolve_lines(context.seller_id, &request.cart.line_items).await?;

        if context.referrer_id.is_some() && context.fundraiser_id.is_some() {
            return Err(reject(
                CheckoutErrorCode::ReferralFundraiserConflict,
                "a checkout cannot carry both a referrer and a fundraiser",
            ));
        }
        let attribution = self.resolve_parties(context).await?;

        if attribution.affiliate_id.is_some() {
            for line in &mut lines {
                line.affiliate_commission_cents = line_affiliate_commission(
                    line.commission_type,
                    line.commission_rate,
                    line.flat_commission_cents,
                    line.line_subtotal_cents(),
                    line.qty,
                );
            }
        }
        let affiliate_rate_bps = attribution
            .affiliate_id
            .and_then(|_| uniform_rate_bps(&lines));

        let product_subtotal_cents: i64 = lines.iter().map(CanonicalLineItem::line_subtotal_cents).sum();
        let affiliate_fee_cents: i64 = lines.iter().map(|l| l.affiliate_commission_cents).sum();
        let is_fundraiser = attribution.fundraiser_id.is_some();
        let split = self
            .fees
            .split(SplitInput {
                product_subtotal_cents,
                affiliate_fee_cents,
                has_referral: attribution.referrer_id.is_some() && !is_fundraiser,
                is_fundraiser,
            })
            .map_err(|e| match e {
                FeeSplitError::ReferralFundraiserConflict => {
                    reject(CheckoutErrorCode::ReferralFundraiserConflict, e.to_string())
                }
                other => ServiceError::InternalError(other.to_string()),
            })?;

        let shipping_cents = request.cart.shipping_cents;
        let tax_cents = request.cart.tax_cents;
        let base_total_cents = split.items_and_fees_cents() + shipping_cents + tax_cents;
        let processing_fee_cents = self.fees.processing_fee_cents(base_total_cents);
        let total_cents = base_total_cents + processing_fee_cents;

        let now = Utc::now();
        let intent_id = Uuid::new_v4();
        let split_json = json!({
            "split_version": self.split_version,
            "schedule": self.fees,
            "split": split,
            "shipping_cents": shipping_cents,
            "tax_cents": tax_cents,
            "processing_fee_cents": processing_fee_cents,
            "seller_transfer_cents": split.seller_transfer_cents(),
            "total_cents": total_cents,
            "affiliate_rate_bps": affiliate_rate_bps,
            "computed_at": now.to_rfc3339(),
        });

        let intent = checkout_intent::ActiveModel {
            id: Set(intent_id),
            seller_id: Set(context.seller_id),
            buyer_id: Set(context.buyer_id),
            affiliate_id: Set(attribution.affiliate_id),
            referrer_id: Set(attribution.referrer_id),
            fundraiser_id: Set(attribution.fundraiser_id),
            store_id: Set(context.store_id),
            currency: Set(currency.clone()),
            line_items: Set(serde_json::to_value(&lines)?),
            items_subtotal_cents: Set(split.product_subtotal_cents),
            affiliate_fee_cents: Set(split.affiliate_fee_cents),
            platform_fee_cents: Set(split.platform_fee_cents),
            ref_or_fundraiser_fee_cents: Set(split.ref_or_fundraiser_fee_cents),
            shipping_cents: Set(shipping_cents),
            tax_cents: Set(tax_cents),
            processing_fee_cents: Set(processing_fee_cents),
            seller_transfer_cents: Set(split.seller_transfer_cents()),
            total_cents: Set(total_cents),
            affiliate_rate_bps: Set(affiliate_rate_bps),
            split_version: Set(self.split_version.clone()),
            split_json: Set(split_json),
            status: Set(IntentStatus::Created),
            provider_session_id: Set(None),
            provider_payment_intent_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await
        .map_err(ServiceError::db_error)?;

        let session_request = CheckoutSessionRequest {
            currency: currency.clone(),
            line_items: session_line_items(&lines, &intent),
            success_url: request.success_url.clone(),
            cancel_url: request.cancel_url.clone(),
            metadata: session_metadata(&intent),
        };

        let session = match self.payments.create_checkout_session(&session_request).await {
            Ok(session) => session,
            Err(e) => {
                warn!(intent_id = %intent.id, error = %e, "Checkout session creation failed");
                let mut abandoned: checkout_intent::ActiveModel = intent.into();
                abandoned.status = Set(IntentStatus::Abandoned);
                abandoned.updated_at = Set(Utc::now());
                if let Err(db_err) = abandoned.update(&*self.db_pool).await {
                    warn!(error = %db_err, "Failed to mark checkout intent abandoned");
                }
                return Err(e.into());
            }
        };

        let mut update: checkout_intent::ActiveModel = intent.into();
        update.provider_session_id = Set(Some(session.id.clone()));
        update.updated_at = Set(Utc::now());
        update
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        counter!("settlement.checkouts.created", 1, "currency" => currency);
        info!(
            intent_id = %intent_id,
            total_cents,
            processing_fee_cents,
            session_id = %session.id,
            "Checkout intent created"
        );

        Ok(CheckoutCreated {
            url: session.url,
            checkout_intent_id: intent_id,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_intent(&self, id: Uuid) -> Result<checkout_intent::Model, ServiceError> {
        checkout_intent::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Checkout intent {} not found", id)))
    }

    /// Resolves every cart line against the catalog. Fails on the first bad line.
    async fn resolve_lines(
        &self,
        seller_id: Uuid,
        inputs: &[CartLineInput],
    ) -> Result<Vec<CanonicalLineItem>, ServiceError> {
        let product_ids: Vec<Uuid> = inputs.iter().map(|l| l.product_id).collect();
        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids.clone()))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let refs: Vec<&str> = inputs
            .iter()
            .filter_map(|l| l.variant_id.as_deref())
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect();
        let variants = if refs.is_empty() {
            Vec::new()
        } else {
            let by_id: Vec<Uuid> = refs
                .iter()
                .filter(|r| looks_like_uuid(r))
                .filter_map(|r| Uuid::parse_str(r).ok())
                .collect();
            let by_supplier: Vec<String> = refs
                .iter()
                .filter(|r| !looks_like_uuid(r))
                .map(|r| r.to_string())
                .collect();
            product_variant::Entity::find()
                .filter(product_variant::Column::ProductId.is_in(product_ids))
                .filter(
                    Condition::any()
                        .add(product_variant::Column::Id.is_in(by_id))
                        .add(product_variant::Column::CjVariantId.is_in(by_supplier)),
                )
                .all(&*self.db_pool)
                .await
                .map_err(ServiceError::db_error)?
        };

        let mut lines = Vec::with_capacity(inputs.len());
        // requested quantity per stock counter, across lines
        let mut demand: HashMap<(Uuid, Option<Uuid>), i32> = HashMap::new();

        for input in inputs {
            if input.qty < 1 {
                return Err(CheckoutRejection::new(
                    CheckoutErrorCode::InvalidQuantity,
                    "quantity must be at least 1",
                )
                .for_product(input.product_id)
                .into());
            }

            let product = products.get(&input.product_id).ok_or_else(|| {
                ServiceError::from(
                    CheckoutRejection::new(CheckoutErrorCode::ProductNotFound, "product not found")
                        .for_product(input.product_id),
                )
            })?;
            let fail = |code: CheckoutErrorCode, message: &str| -> ServiceError {
                CheckoutRejection::new(code, message)
                    .for_product(product.id)
                    .into()
            };
            if product.seller_id != seller_id {
                return Err(fail(
                    CheckoutErrorCode::ProductSellerMismatch,
                    "product does not belong to this seller",
                ));
            }
            if !product.is_active {
                return Err(fail(CheckoutErrorCode::ProductInactive, "product is not active"));
            }
            if !product.is_promotable {
                return Err(fail(
                    CheckoutErrorCode::ProductNotPromotable,
                    "product is not available for marketplace sale",
                ));
            }
            if product.seller_ask_cents <= 0 {
                return Err(fail(CheckoutErrorCode::InvalidPrice, "product has no valid price"));
            }

            let variant = match input.variant_id.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                None => None,
                Some(variant_ref) => {
                    let by_uuid = looks_like_uuid(variant_ref);
                    let found = variants.iter().find(|v| {
                        v.product_id == product.id
                            && if by_uuid {
                                Uuid::parse_str(variant_ref).map(|id| id == v.id).unwrap_or(false)
                            } else {
                                v.cj_variant_id.as_deref() == Some(variant_ref)
                            }
                    });
                    match found {
                        Some(v) if v.is_active => Some(v),
                        _ => {
                            return Err(CheckoutRejection::new(
                                CheckoutErrorCode::InvalidVariant,
                                "variant not found for product",
                            )
                            .for_product(product.id)
                            .for_variant(variant_ref)
                            .into())
                        }
                    }
                }
            };

            let unit_price_cents = variant
                .map(|v| v.price_cents)
                .filter(|p| *p > 0)
                .unwrap_or(product.seller_ask_cents);
            if unit_price_cents <= 0 {
                return Err(fail(CheckoutErrorCode::InvalidPrice, "variant has no valid price"));
            }

            // variant stock when the variant tracks it, else product stock
            let (stock_key, stock) = match variant.filter(|v| v.stock_quantity.is_some()) {
                Some(v) => ((product.id, Some(v.id)), v.stock_quantity),
                None => ((product.id, None), product.stock_quantity),
            };
            if let Some(available) = stock {
                let requested = demand.entry(stock_key).or_insert(0);
                *requested += input.qty;
                if *requested > available {
                    return Err(CheckoutRejection::out_of_stock(
                        product.id,
                        input.variant_id.clone(),
                        *requested,
                        available,
                    )
                    .into());
                }
            }

            let name = match variant {
                Some(v) if !v.title.trim().is_empty() => format!("{} - {}", product.title, v.title),
                _ => product.title.clone(),
            };
            lines.push(CanonicalLineItem {
                product_id: product.id,
                variant_id: variant.map(|v| v.id),
                name,
                qty: input.qty,
                unit_price_cents,
                seller_desired_amount_cents: unit_price_cents,
                commission_type: product.commission_type,
                commission_rate: product.commission_rate,
                flat_commission_cents: product.flat_commission_cents,
                affiliate_commission_cents: 0,
            });
        }
        Ok(lines)
    }

    /// Checks every attributed party can be paid and resolves an inherited referrer.
    async fn resolve_parties(&self, context: &CheckoutContext) -> Result<Attribution, ServiceError> {
        let mut ids = vec![context.seller_id];
        ids.extend(context.affiliate_id);
        ids.extend(context.referrer_id);
        ids.extend(context.fundraiser_id);
        let mut profiles: HashMap<Uuid, profile::Model> = self.load_profiles(ids).await?;

        let seller_ok = profiles
            .get(&context.seller_id)
            .map(profile::Model::payment_account_verified)
            .unwrap_or(false);
        if !seller_ok {
            return Err(reject(
                CheckoutErrorCode::SellerNotPayable,
                "seller has not completed payout onboarding",
            ));
        }

        let payable = |profiles: &HashMap<Uuid, profile::Model>, id: Uuid| {
            profiles
                .get(&id)
                .map(profile::Model::has_payment_account)
                .unwrap_or(false)
        };

        if let Some(affiliate_id) = context.affiliate_id {
            if !payable(&profiles, affiliate_id) {
                return Err(reject(
                    CheckoutErrorCode::AffiliateNotPayable,
                    "affiliate has no payout account",
                ));
            }
        }
        if let Some(fundraiser_id) = context.fundraiser_id {
            if !payable(&profiles, fundraiser_id) {
                return Err(reject(
                    CheckoutErrorCode::FundraiserNotPayable,
                    "fundraiser has no payout account",
                ));
            }
        }

        let mut referrer_id = context.referrer_id;
        if let Some(explicit) = referrer_id {
            if !payable(&profiles, explicit) {
                return Err(reject(
                    CheckoutErrorCode::ReferrerNotPayable,
                    "referrer has no payout account",
                ));
            }
        } else if context.fundraiser_id.is_none() {
            let inherited = context
                .affiliate_id
                .and_then(|id| profiles.get(&id))
                .and_then(|p| p.referred_by_affiliate_id);
            if let Some(inherited) = inherited {
                profiles.extend(self.load_profiles(vec![inherited]).await?);
                if payable(&profiles, inherited) {
                    referrer_id = Some(inherited);
                } else {
                    warn!(referrer_id = %inherited, "Inherited referrer has no payout account; not attributing");
                }
            }
        }

        Ok(Attribution {
            affiliate_id: context.affiliate_id,
            referrer_id,
            fundraiser_id: context.fundraiser_id,
        })
    }

    async fn load_profiles(&self, ids: Vec<Uuid>) -> Result<HashMap<Uuid, profile::Model>, ServiceError> {
        Ok(profile::Entity::find()
            .filter(profile::Column::Id.is_in(ids))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect())
    }
}

fn fee_item(name: &str, amount_cents: i64) -> Option<SessionLineItem> {
    (amount_cents > 0).then(|| SessionLineItem {
        name: name.to_string(),
        quantity: 1,
        unit_amount_cents: amount_cents,
        metadata: BTreeMap::new(),
    })
}

/// One row per product, then one per non-zero fee component.
fn session_line_items(lines: &[CanonicalLineItem], intent: &checkout_intent::Model) -> Vec<SessionLineItem> {
    let mut items: Vec<SessionLineItem> = lines
        .iter()
        .map(|line| {
            let mut metadata = BTreeMap::new();
            metadata.insert("product_id".to_string(), line.product_id.to_string());
            if let Some(variant_id) = line.variant_id {
                metadata.insert("variant_id".to_string(), variant_id.to_string());
            }
            SessionLineItem {
                name: line.name.clone(),
                quantity: line.qty,
                unit_amount_cents: line.unit_price_cents,
                metadata,
            }
        })
        .collect();

    let ref_label = if intent.fundraiser_id.is_some() {
        "Fundraiser fee"
    } else {
        "Referral fee"
    };
    items.extend(
        [
            fee_item("Affiliate commission", intent.affiliate_fee_cents),
            fee_item("Platform fee", intent.platform_fee_cents),
            fee_item(ref_label, intent.ref_or_fundraiser_fee_cents),
            fee_item("Shipping", intent.shipping_cents),
            fee_item("Tax", intent.tax_cents),
            fee_item("Processing fee", intent.processing_fee_cents),
        ]
        .into_iter()
        .flatten(),
    );
    items
}

fn session_metadata(intent: &checkout_intent::Model) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("checkout_intent_id".to_string(), intent.id.to_string());
    metadata.insert("split_version".to_string(), intent.split_version.clone());
    metadata.insert("seller_id".to_string(), intent.seller_id.to_string());
    let optional = [
        ("buyer_id", intent.buyer_id),
        ("affiliate_id", intent.affiliate_id),
        ("referrer_id", intent.referrer_id),
        ("fundraiser_id", intent.fundraiser_id),
    ];
    for (key, value) in optional {
        if let Some(id) = value {
            metadata.insert(key.to_string(), id.to_string());
        }
    }
    metadata
}
