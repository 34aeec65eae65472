use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::user_earning::EarningRole;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PayoutStatus {
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// One external transfer attempt within a batch.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payouts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub batch_id: Uuid,
    pub user_id: Uuid,
    pub role: EarningRole,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payout_batch::Entity",
        from = "Column::BatchId",
        to = "super::payout_batch::Column::Id"
    )]
    PayoutBatch,
}

impl Related<super::payout_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PayoutBatch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
