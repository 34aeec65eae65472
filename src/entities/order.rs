use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "waiting_funds")]
    WaitingFunds,
    #[sea_orm(string_value = "blocked_inventory")]
    BlockedInventory,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl FulfillmentStatus {
    /// Seller holds may only be released once goods are on their way.
    pub fn releases_seller_hold(self) -> bool {
        matches!(self, Self::Shipped | Self::Delivered)
    }

    /// Supplier-driven updates only move an order forward. Terminal states and
    /// orders that never reached the supplier are left alone.
    pub fn can_advance_to(self, next: Self) -> bool {
        let in_flight = matches!(self, Self::Pending | Self::WaitingFunds | Self::Processing);
        match next {
            Self::Processing => in_flight,
            Self::Shipped | Self::Failed => in_flight || self == Self::Shipped,
            Self::Delivered => in_flight || matches!(self, Self::Shipped | Self::Delivered),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub checkout_intent_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_id: Option<Uuid>,
    pub affiliate_id: Option<Uuid>,
    pub referrer_id: Option<Uuid>,
    pub fundraiser_id: Option<Uuid>,
    pub currency: String,
    pub items_subtotal_cents: i64,
    pub shipping_cents: i64,
    pub tax_cents: i64,
    pub affiliate_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub ref_or_fundraiser_fee_cents: i64,
    pub processing_fee_cents: i64,
    pub total_cents: i64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    #[sea_orm(unique)]
    pub payment_intent_id: Option<String>,
    pub billing_email: Option<String>,
    pub billing_name: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_address: Option<Json>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
