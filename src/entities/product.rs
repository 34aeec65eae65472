use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "flat_rate")]
    FlatRate,
}

/// Catalog product as the settlement core sees it. Prices are the seller's ask in cents.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub seller_ask_cents: i64,
    pub commission_type: CommissionType,
    /// Percent of the line subtotal, used when `commission_type` is percentage
    pub commission_rate: f64,
    pub flat_commission_cents: i64,
    /// `None` means stock is not tracked for this product
    pub stock_quantity: Option<i32>,
    pub is_active: bool,
    pub is_promotable: bool,
    pub sales_count: i32,
    pub cj_product_id: Option<String>,
    pub cj_variant_id: Option<String>,
    pub supplier_cost_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_variant::Entity")]
    Variants,
}

impl Related<super::product_variant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Variants.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
