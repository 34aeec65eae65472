use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EarningRole {
    #[sea_orm(string_value = "seller")]
    Seller,
    #[sea_orm(string_value = "affiliate")]
    Affiliate,
    #[sea_orm(string_value = "referrer")]
    Referrer,
    #[sea_orm(string_value = "fundraiser")]
    Fundraiser,
}

/// Running balance per (user, role).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_earnings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub role: EarningRole,
    pub held_balance_cents: i64,
    pub current_balance_cents: i64,
    pub pending_payout_cents: i64,
    pub total_earned_cents: i64,
    pub paid_out_cents: i64,
    pub last_payout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// The figure a payout run would transfer.
    pub fn payable_cents(&self) -> i64 {
        self.current_balance_cents.max(self.pending_payout_cents)
    }
}
