//! Scheduled payout batches.
//!
//! The scheduled run happens on the configured days of the month (UTC). An
//! off-cycle run is only allowed as an administrator paying out their own
//! balance. Balances are debited by the figures observed when the batch was
//! assembled, so credits arriving during the run are kept.

use chrono::{DateTime, Datelike, Utc};
use metrics::counter;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::JobAccess;
use crate::clients::payment_processor::TransferRequest;
use crate::clients::PaymentProcessor;
use crate::config::PayoutConfig;
use crate::entities::payout::{self, PayoutStatus};
use crate::entities::payout_batch::{self, BatchStatus};
use crate::entities::user_earning::{self, EarningRole};
use crate::entities::profile;
use crate::errors::ServiceError;
use crate::services::earnings::{EarningsService, ReleaseScope};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PayoutRunRequest {
    pub force: bool,
    #[serde(alias = "dryRun")]
    pub dry_run: bool,
    #[serde(alias = "onlyUserId")]
    pub only_user_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub bi_monthly_days_utc: Vec<u32>,
    pub today_utc: String,
    pub forced: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutResults {
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total_amount_cents: i64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRunReport {
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
    pub schedule: ScheduleInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<PayoutResults>,
}

pub fn is_payout_day(now: DateTime<Utc>, payout_days: &[u32]) -> bool {
    payout_days.contains(&now.day())
}

/// Scheduled runs are numbered per day so a second trigger on the same day is a no-op.
pub fn batch_number(now: DateTime<Utc>, scheduled: bool) -> String {
    if scheduled {
        format!("BIMONTHLY_{}", now.format("%Y%m%d"))
    } else {
        format!("MANUAL_{}", now.timestamp_millis())
    }
}

struct Candidate {
    earning: user_earning::Model,
    destination: String,
}

#[derive(Clone)]
pub struct PayoutService {
    db_pool: Arc<DatabaseConnection>,
    payments: Arc<dyn PaymentProcessor>,
    earnings: EarningsService,
    config: PayoutConfig,
}

impl PayoutService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        payments: Arc<dyn PaymentProcessor>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            earnings: EarningsService::new(db_pool.clone()),
            db_pool,
            payments,
            config,
        }
    }

    #[instrument(skip(self, access), fields(force = request.force, dry_run = request.dry_run))]
    pub async fn run_batch(
        &self,
        request: PayoutRunRequest,
        access: &JobAccess,
        now: DateTime<Utc>,
    ) -> Result<PayoutRunReport, ServiceError> {
        let scheduled_day = is_payout_day(now, &self.config.payout_days);
        let schedule = ScheduleInfo {
            bi_monthly_days_utc: self.config.payout_days.clone(),
            today_utc: now.format("%Y-%m-%d").to_string(),
            forced: request.force,
            dry_run: request.dry_run,
        };
        let admin_self_payout = matches!(
            (access.admin_id(), request.only_user_id),
            (Some(admin), Some(only)) if admin == only
        );

        if !scheduled_day {
            if !request.force {
                return Ok(skipped(schedule, None, "Not a scheduled payout day"));
            }
            if request.only_user_id.is_none() {
                return Err(ServiceError::InvalidInput(
                    "only_user_id is required for an off-cycle payout".to_string(),
                ));
            }
            if !admin_self_payout {
                warn!("Rejected off-cycle payout for another user");
                return Err(ServiceError::Forbidden(
                    "off-cycle payouts are limited to an administrator's own balance".to_string(),
                ));
            }
        }

        let number = batch_number(now, scheduled_day && request.only_user_id.is_none());
        let db = &*self.db_pool;
        let already_ran = payout_batch::Entity::find()
            .filter(payout_batch::Column::BatchNumber.eq(number.clone()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .is_some();
        if already_ran {
            return Ok(skipped(schedule, Some(number), "Payout batch already ran"));
        }

        if !request.dry_run {
            self.earnings.release_held(ReleaseScope::Due { now }).await?;
            // an off-cycle self-payout may include sales still inside the holding period
            if admin_self_payout && request.force && !scheduled_day {
                if let Some(admin) = access.admin_id() {
                    self.earnings
                        .release_held(ReleaseScope::ImmediateFor(admin))
                        .await?;
                }
            }
        }

        let mut results = PayoutResults::default();
        let candidates = self
            .candidates(request.only_user_id, admin_self_payout, &mut results)
            .await?;

        if request.dry_run {
            results.processed = candidates.len() as u32;
            results.total_amount_cents = candidates.iter().map(|c| c.earning.payable_cents()).sum();
            info!(
                batch_number = %number,
                candidates = results.processed,
                total_amount_cents = results.total_amount_cents,
                "Payout dry run"
            );
            return Ok(PayoutRunReport {
                success: true,
                skipped: false,
                message: Some("Dry run; nothing was transferred".to_string()),
                batch_number: Some(number),
                schedule,
                results: Some(results),
            });
        }

        let batch = payout_batch::ActiveModel {
            id: Set(Uuid::new_v4()),
            batch_number: Set(number.clone()),
            status: Set(BatchStatus::Processing),
            total_amount_cents: Set(0),
            payout_count: Set(0),
            failed_count: Set(0),
            created_at: Set(now),
            completed_at: Set(None),
        }
        .insert(db)
        .await;
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                // a concurrent trigger inserted the same batch number
                warn!(batch_number = %number, error = %e, "Could not open payout batch");
                return Ok(skipped(schedule, Some(number), "Payout batch already ran"));
            }
        };

        for candidate in candidates {
            results.processed += 1;
            match self.pay(&batch, &candidate, now).await {
                Ok(amount) => {
                    results.successful += 1;
                    results.total_amount_cents += amount;
                }
                Err(reason) => {
                    results.failed += 1;
                    results.errors.push(format!(
                        "{} ({}): {}",
                        candidate.earning.user_id, candidate.earning.role, reason
                    ));
                }
            }
        }

        let status = if results.failed > 0 {
            BatchStatus::PartiallyCompleted
        } else {
            BatchStatus::Completed
        };
        payout_batch::Entity::update_many()
            .col_expr(payout_batch::Column::Status, Expr::value(status))
            .col_expr(payout_batch::Column::TotalAmountCents, Expr::value(results.total_amount_cents))
            .col_expr(payout_batch::Column::PayoutCount, Expr::value(results.successful as i32))
            .col_expr(payout_batch::Column::FailedCount, Expr::value(results.failed as i32))
            .col_expr(payout_batch::Column::CompletedAt, Expr::value(Utc::now()))
            .filter(payout_batch::Column::Id.eq(batch.id))
            .exec(db)
            .await
            .map_err(ServiceError::db_error)?;

        counter!("settlement.payouts.batches", 1, "status" => status.to_string());
        info!(
            batch_number = %number,
            successful = results.successful,
            failed = results.failed,
            skipped = results.skipped,
            total_amount_cents = results.total_amount_cents,
            "Payout batch finished"
        );
        Ok(PayoutRunReport {
            success: true,
            skipped: false,
            message: None,
            batch_number: Some(number),
            schedule,
            results: Some(results),
        })
    }

    /// Balances at or above the minimum whose owner can receive a transfer.
    async fn candidates(
        &self,
        only_user_id: Option<Uuid>,
        admin_self_payout: bool,
        results: &mut PayoutResults,
    ) -> Result<Vec<Candidate>, ServiceError> {
        let db = &*self.db_pool;
        let minimum = self.config.minimum_payout_cents;
        let mut query = user_earning::Entity::find().filter(
            Condition::any()
                .add(user_earning::Column::CurrentBalanceCents.gte(minimum))
                .add(user_earning::Column::PendingPayoutCents.gte(minimum)),
        );
        if let Some(user_id) = only_user_id {
            query = query.filter(user_earning::Column::UserId.eq(user_id));
        }
        let rows = query.all(db).await.map_err(ServiceError::db_error)?;

        let user_ids: Vec<Uuid> = rows.iter().map(|r| r.user_id).collect();
        let profiles: HashMap<Uuid, profile::Model> = profile::Entity::find()
            .filter(profile::Column::Id.is_in(user_ids))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut candidates = Vec::new();
        for earning in rows {
            let Some(profile) = profiles.get(&earning.user_id) else {
                results.skipped += 1;
                continue;
            };
            let Some(destination) = profile
                .payment_account_id
                .clone()
                .filter(|_| profile.has_payment_account())
            else {
                results.skipped += 1;
                continue;
            };
            if earning.role == EarningRole::Seller
                && !admin_self_payout
                && !profile.seller_fully_verified()
            {
                results.skipped += 1;
                continue;
            }
            candidates.push(Candidate { earning, destination });
        }
        Ok(candidates)
    }

    /// Transfers one balance and records the attempt. Returns the amount paid
    /// or the failure reason.
    async fn pay(
        &self,
        batch: &payout_batch::Model,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        let db = &*self.db_pool;
        let earning = &candidate.earning;
        let amount = earning.payable_cents();
        let mut metadata = BTreeMap::new();
        metadata.insert("batch_number".to_string(), batch.batch_number.clone());
        metadata.insert("user_id".to_string(), earning.user_id.to_string());
        metadata.insert("role".to_string(), earning.role.to_string());
        let request = TransferRequest {
            amount_cents: amount,
            currency: self.config.currency.clone(),
            destination_account: candidate.destination.clone(),
            idempotency_key: format!(
                "payout-{}-{}-{}",
                batch.batch_number, earning.user_id, earning.role
            ),
            metadata,
        };

        let outcome = self.payments.create_transfer(&request).await;
        let (status, transfer_id, failure_reason, recorded_amount) = match &outcome {
            Ok(transfer) => (PayoutStatus::Completed, Some(transfer.id.clone()), None, amount),
            Err(e) => (
                PayoutStatus::Failed,
                None,
                Some(e.to_string()),
                earning.current_balance_cents,
            ),
        };
        let record = payout::ActiveModel {
            id: Set(Uuid::new_v4()),
            batch_id: Set(batch.id),
            user_id: Set(earning.user_id),
            role: Set(earning.role),
            amount_cents: Set(recorded_amount),
            currency: Set(self.config.currency.clone()),
            status: Set(status),
            transfer_id: Set(transfer_id),
            failure_reason: Set(failure_reason),
            created_at: Set(now),
        };
        if let Err(e) = payout::Entity::insert(record).exec_without_returning(db).await {
            error!(user_id = %earning.user_id, error = %e, "Failed to record payout");
        }

        match outcome {
            Ok(transfer) => {
                let debited = user_earning::Entity::update_many()
                    .col_expr(
                        user_earning::Column::CurrentBalanceCents,
                        Expr::col(user_earning::Column::CurrentBalanceCents)
                            .sub(earning.current_balance_cents),
                    )
                    .col_expr(
                        user_earning::Column::PendingPayoutCents,
                        Expr::col(user_earning::Column::PendingPayoutCents)
                            .sub(earning.pending_payout_cents),
                    )
                    .col_expr(
                        user_earning::Column::PaidOutCents,
                        Expr::col(user_earning::Column::PaidOutCents).add(amount),
                    )
                    .col_expr(user_earning::Column::LastPayoutAt, Expr::value(now))
                    .col_expr(user_earning::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(user_earning::Column::Id.eq(earning.id))
                    .exec(db)
                    .await;
                if let Err(e) = debited {
                    error!(
                        user_id = %earning.user_id,
                        transfer_id = %transfer.id,
                        error = %e,
                        "Transfer sent but balance was not debited"
                    );
                }
                counter!("settlement.payouts.transfers", 1, "status" => "completed");
                info!(user_id = %earning.user_id, role = %earning.role, amount, "Payout transferred");
                Ok(amount)
            }
            Err(e) => {
                counter!("settlement.payouts.transfers", 1, "status" => "failed");
                warn!(user_id = %earning.user_id, role = %earning.role, error = %e, "Payout transfer failed");
                Err(e.to_string())
            }
        }
    }
}

fn skipped(schedule: ScheduleInfo, batch_number: Option<String>, message: &str) -> PayoutRunReport {
    PayoutRunReport {
        success: true,
        skipped: true,
        message: Some(message.to_string()),
        batch_number,
        schedule,
        results: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(1, true)]
    #[case(15, true)]
    #[case(2, false)]
    #[case(14, false)]
    #[case(31, false)]
    fn payout_days_follow_the_calendar(#[case] day: u32, #[case] expected: bool) {
        let now = Utc.with_ymd_and_hms(2026, 1, day, 23, 59, 0).unwrap();
        assert_eq!(is_payout_day(now, &[1, 15]), expected);
    }

    #[test]
    fn scheduled_batches_are_numbered_per_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 6, 0, 0).unwrap();
        assert_eq!(batch_number(now, true), "BIMONTHLY_20260315");
        assert!(batch_number(now, false).starts_with("MANUAL_"));
    }

    #[test]
    fn run_request_accepts_both_casings() {
        let id = Uuid::new_v4();
        let snake: PayoutRunRequest =
            serde_json::from_value(serde_json::json!({ "force": true, "only_user_id": id })).unwrap();
        let camel: PayoutRunRequest =
            serde_json::from_value(serde_json::json!({ "dryRun": true, "onlyUserId": id })).unwrap();
        assert_eq!(snake.only_user_id, Some(id));
        assert!(snake.force);
        assert!(camel.dry_run);
        assert_eq!(camel.only_user_id, Some(id));
    }
}
