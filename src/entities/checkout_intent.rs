use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentStatus {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "abandoned")]
    Abandoned,
}

/// Server-priced checkout. Amount columns are never updated after insert.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_intents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub seller_id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub affiliate_id: Option<Uuid>,
    pub referrer_id: Option<Uuid>,
    pub fundraiser_id: Option<Uuid>,
    pub store_id: Option<Uuid>,
    pub currency: String,
    /// Canonical line items, see `services::checkout_intent::CanonicalLineItem`
    #[sea_orm(column_type = "Json")]
    pub line_items: Json,
    pub items_subtotal_cents: i64,
    pub affiliate_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub ref_or_fundraiser_fee_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub processing_fee_cents: i64,
    pub seller_transfer_cents: i64,
    pub total_cents: i64,
    pub affiliate_rate_bps: Option<i32>,
    pub split_version: String,
    #[sea_orm(column_type = "Json")]
    pub split_json: Json,
    pub status: IntentStatus,
    pub provider_session_id: Option<String>,
    pub provider_payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Sum of every stored component; equals `total_cents` for a well-formed intent.
    pub fn breakdown_sum(&self) -> i64 {
        self.items_subtotal_cents
            + self.affiliate_fee_cents
            + self.platform_fee_cents
            + self.ref_or_fundraiser_fee_cents
            + self.shipping_cents
            + self.tax_cents
            + self.processing_fee_cents
    }
}
