use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A marketplace participant: seller, affiliate, fundraiser or administrator.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "profiles")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub role: String,
    pub full_name: Option<String>,
    pub email: Option<String>,
    /// Connected payout account at the payment processor
    pub payment_account_id: Option<String>,
    pub payment_account_status: Option<String>,
    pub seller_verification_status: Option<String>,
    pub identity_verification_status: Option<String>,
    /// The affiliate who recruited this profile, if any
    pub referred_by_affiliate_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn has_payment_account(&self) -> bool {
        self.payment_account_id
            .as_deref()
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn payment_account_verified(&self) -> bool {
        self.has_payment_account()
            && self
                .payment_account_status
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("verified"))
                .unwrap_or(false)
    }

    /// Seller payouts additionally need both seller and identity checks to be complete.
    pub fn seller_fully_verified(&self) -> bool {
        let verified = |s: &Option<String>| {
            s.as_deref()
                .map(|v| v.eq_ignore_ascii_case("verified"))
                .unwrap_or(false)
        };
        verified(&self.seller_verification_status) && verified(&self.identity_verification_status)
    }

    pub fn has_role_in(&self, roles: &[String]) -> bool {
        roles.iter().any(|r| r.eq_ignore_ascii_case(self.role.trim()))
    }
}
