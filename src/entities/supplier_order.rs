use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SupplierOrderStatus {
    #[sea_orm(string_value = "waiting_funds")]
    WaitingFunds,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "fulfilled")]
    Fulfilled,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "blocked_inventory")]
    BlockedInventory,
}

/// Drop-ship purchase placed with the supplier. At most one per marketplace order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "supplier_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_id: Uuid,
    #[sea_orm(unique)]
    pub supplier_order_number: String,
    pub supplier_order_id: Option<String>,
    pub status: SupplierOrderStatus,
    pub estimated_cost_cents: Option<i64>,
    pub error_message: Option<String>,
    /// Last status string reported by the supplier, lower-cased
    pub supplier_status: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub payload: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
