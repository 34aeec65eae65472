//! Per-user running balances and release of time-held seller funds.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Iterable, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::order::{self, FulfillmentStatus};
use crate::entities::payment_distribution::{self, DistributionStatus, RecipientType};
use crate::entities::user_earning::{self, EarningRole};
use crate::errors::ServiceError;

const RELEASE_BATCH_LIMIT: u64 = 500;

/// Which balance a credit lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceBucket {
    /// Not yet payable; moved to current when the holding period ends
    Held,
    Current,
}

/// Adds `amount_cents` to a user's balance, creating the row on first credit.
/// A single upsert, so concurrent credits for the same user never lose updates.
pub async fn credit<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
    role: EarningRole,
    amount_cents: i64,
    bucket: BalanceBucket,
) -> Result<(), DbErr> {
    if amount_cents <= 0 {
        return Ok(());
    }
    let now = Utc::now();
    let (held, current) = match bucket {
        BalanceBucket::Held => (amount_cents, 0),
        BalanceBucket::Current => (0, amount_cents),
    };
    let row = user_earning::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        role: Set(role),
        held_balance_cents: Set(held),
        current_balance_cents: Set(current),
        pending_payout_cents: Set(0),
        total_earned_cents: Set(amount_cents),
        paid_out_cents: Set(0),
        last_payout_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let bump = |col: user_earning::Column, by: i64| {
        Expr::col((user_earning::Entity, col)).add(by)
    };
    let balance_col = match bucket {
        BalanceBucket::Held => user_earning::Column::HeldBalanceCents,
        BalanceBucket::Current => user_earning::Column::CurrentBalanceCents,
    };
    let mut on_conflict =
        OnConflict::columns([user_earning::Column::UserId, user_earning::Column::Role]);
    on_conflict
        .value(balance_col, bump(balance_col, amount_cents))
        .value(
            user_earning::Column::TotalEarnedCents,
            bump(user_earning::Column::TotalEarnedCents, amount_cents),
        )
        .value(user_earning::Column::UpdatedAt, Expr::value(now));

    user_earning::Entity::insert(row)
        .on_conflict(on_conflict)
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// Moves `amount_cents` of a seller's held balance into the payable balance.
pub async fn release_to_current<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
    amount_cents: i64,
) -> Result<u64, DbErr> {
    let result = user_earning::Entity::update_many()
        .col_expr(
            user_earning::Column::HeldBalanceCents,
            Expr::col(user_earning::Column::HeldBalanceCents).sub(amount_cents),
        )
        .col_expr(
            user_earning::Column::CurrentBalanceCents,
            Expr::col(user_earning::Column::CurrentBalanceCents).add(amount_cents),
        )
        .col_expr(user_earning::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(user_earning::Column::UserId.eq(user_id))
        .filter(user_earning::Column::Role.eq(EarningRole::Seller))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Which held rows a release run may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseScope {
    /// Rows whose holding period has elapsed at `now` and whose order has shipped
    Due { now: DateTime<Utc> },
    /// Every held seller row of one user, regardless of holding period
    ImmediateFor(Uuid),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSummary {
    pub examined: u64,
    pub released: u64,
    pub released_cents: i64,
}

#[derive(Clone)]
pub struct EarningsService {
    db_pool: Arc<DatabaseConnection>,
}

impl EarningsService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Transitions held seller distributions to pending and moves the matching
    /// amounts from held to current balance. Each row moves in its own transaction.
    #[instrument(skip(self))]
    pub async fn release_held(&self, scope: ReleaseScope) -> Result<ReleaseSummary, ServiceError> {
        let mut summary = ReleaseSummary::default();
        loop {
            let page = self.releasable_page(scope).await?;
            let full_page = page.len() as u64 == RELEASE_BATCH_LIMIT;
            summary.examined += page.len() as u64;

            let mut released_in_page = 0;
            for row in page {
                match self.release_one(&row).await {
                    Ok(true) => {
                        released_in_page += 1;
                        summary.released_cents += row.amount_cents;
                    }
                    Ok(false) => debug!(distribution_id = %row.id, "Distribution already released"),
                    Err(e) => warn!(distribution_id = %row.id, error = %e, "Failed to release held distribution"),
                }
            }
            summary.released += released_in_page;
            // released rows leave the held set, so the next page starts fresh
            if !full_page || released_in_page == 0 {
                break;
            }
        }

        counter!("settlement.distributions.released", summary.released);
        info!(
            released = summary.released,
            released_cents = summary.released_cents,
            "Held seller distributions released"
        );
        Ok(summary)
    }

    /// Oldest held seller rows the scope allows to move. A due release only
    /// considers rows whose order has shipped or been delivered.
    async fn releasable_page(
        &self,
        scope: ReleaseScope,
    ) -> Result<Vec<payment_distribution::Model>, ServiceError> {
        let query = payment_distribution::Entity::find()
            .filter(payment_distribution::Column::RecipientType.eq(RecipientType::Seller))
            .filter(payment_distribution::Column::Status.eq(DistributionStatus::Held));
        let query = match scope {
            ReleaseScope::Due { now } => query
                .filter(payment_distribution::Column::AvailableAt.lte(now))
                .filter(
                    payment_distribution::Column::OrderId.in_subquery(
                        Query::select()
                            .column(order::Column::Id)
                            .from(order::Entity)
                            .and_where(order::Column::FulfillmentStatus.is_in(
                                FulfillmentStatus::iter().filter(|s| s.releases_seller_hold()),
                            ))
                            .to_owned(),
                    ),
                ),
            ReleaseScope::ImmediateFor(user_id) => {
                query.filter(payment_distribution::Column::RecipientId.eq(user_id))
            }
        };
        query
            .order_by_asc(payment_distribution::Column::AvailableAt)
            .limit(RELEASE_BATCH_LIMIT)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn release_one(&self, row: &payment_distribution::Model) -> Result<bool, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let moved = payment_distribution::Entity::update_many()
            .col_expr(
                payment_distribution::Column::Status,
                Expr::value(DistributionStatus::Pending),
            )
            .col_expr(payment_distribution::Column::ReleasedAt, Expr::value(Utc::now()))
            .filter(payment_distribution::Column::Id.eq(row.id))
            .filter(payment_distribution::Column::Status.eq(DistributionStatus::Held))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if moved.rows_affected == 0 {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            return Ok(false);
        }
        if let Some(seller_id) = row.recipient_id {
            release_to_current(&txn, seller_id, row.amount_cents)
                .await
                .map_err(ServiceError::db_error)?;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(true)
    }
}
