//! Fee split arithmetic for marketplace sales.
//!
//! Every amount is integer cents and every rate is basis points. Percentage
//! fees round half away from zero; only the processing gross-up rounds up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FeeConfig;
use crate::entities::product::CommissionType;

const BPS_DENOMINATOR: i128 = 10_000;

/// The rates a split is computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub platform_fee_bps: u32,
    pub discounted_platform_fee_bps: u32,
    pub referral_fee_bps: u32,
    pub processor_fee_bps: u32,
    pub processor_fixed_cents: i64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::from(&FeeConfig::default())
    }
}

impl From<&FeeConfig> for FeeSchedule {
    fn from(cfg: &FeeConfig) -> Self {
        Self {
            platform_fee_bps: cfg.platform_fee_bps,
            discounted_platform_fee_bps: cfg.discounted_platform_fee_bps,
            referral_fee_bps: cfg.referral_fee_bps,
            processor_fee_bps: cfg.processor_fee_bps,
            processor_fixed_cents: cfg.processor_fixed_cents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInput {
    pub product_subtotal_cents: i64,
    /// Sum of the per-line affiliate commissions
    pub affiliate_fee_cents: i64,
    pub has_referral: bool,
    pub is_fundraiser: bool,
}

/// Output of [`FeeSchedule::split`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub product_subtotal_cents: i64,
    pub affiliate_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub ref_or_fundraiser_fee_cents: i64,
}

impl FeeSplit {
    /// The seller receives the full product subtotal; fees ride on top.
    pub fn seller_transfer_cents(&self) -> i64 {
        self.product_subtotal_cents
    }

    /// Subtotal plus every fee the buyer pays before shipping, tax and processing.
    pub fn items_and_fees_cents(&self) -> i64 {
        self.product_subtotal_cents
            + self.affiliate_fee_cents
            + self.platform_fee_cents
            + self.ref_or_fundraiser_fee_cents
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeeSplitError {
    #[error("{field} must not be negative (got {value})")]
    NegativeAmount { field: &'static str, value: i64 },

    #[error("referral and fundraiser cannot both apply to the same sale")]
    ReferralFundraiserConflict,
}

/// `amount * bps / 10000`, rounded half away from zero.
pub fn round_bps(amount_cents: i64, bps: u32) -> i64 {
    let product = i128::from(amount_cents) * i128::from(bps);
    let half = BPS_DENOMINATOR / 2;
    let rounded = if product >= 0 {
        (product + half) / BPS_DENOMINATOR
    } else {
        (product - half) / BPS_DENOMINATOR
    };
    clamp_i64(rounded)
}

/// Percentage commission on a line, `rate_percent` as stored on the product (e.g. `10.0`).
pub fn round_percent(amount_cents: i64, rate_percent: f64) -> i64 {
    if !rate_percent.is_finite() || rate_percent <= 0.0 || amount_cents <= 0 {
        return 0;
    }
    (amount_cents as f64 * rate_percent / 100.0).round() as i64
}

/// Affiliate commission for one line, from the product's commission terms.
pub fn line_affiliate_commission(
    commission_type: CommissionType,
    commission_rate: f64,
    flat_commission_cents: i64,
    line_subtotal_cents: i64,
    quantity: i32,
) -> i64 {
    match commission_type {
        CommissionType::FlatRate => {
            (flat_commission_cents.max(0)).saturating_mul(i64::from(quantity.max(1)))
        }
        CommissionType::Percentage => round_percent(line_subtotal_cents, commission_rate).max(0),
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

impl FeeSchedule {
    pub fn platform_fee_bps(&self, discounted: bool) -> u32 {
        if discounted {
            self.discounted_platform_fee_bps
        } else {
            self.platform_fee_bps
        }
    }

    /// Splits a subtotal into platform and referral/fundraiser shares.
    pub fn split(&self, input: SplitInput) -> Result<FeeSplit, FeeSplitError> {
        if input.product_subtotal_cents < 0 {
            return Err(FeeSplitError::NegativeAmount {
                field: "product_subtotal_cents",
                value: input.product_subtotal_cents,
            });
        }
        if input.affiliate_fee_cents < 0 {
            return Err(FeeSplitError::NegativeAmount {
                field: "affiliate_fee_cents",
                value: input.affiliate_fee_cents,
            });
        }
        if input.has_referral && input.is_fundraiser {
            return Err(FeeSplitError::ReferralFundraiserConflict);
        }

        let subtotal = input.product_subtotal_cents;
        let attributed = input.has_referral || input.is_fundraiser;

        let platform_fee_cents =
            round_bps(subtotal, self.platform_fee_bps(attributed)).clamp(0, subtotal);
        let ref_or_fundraiser_fee_cents = if attributed {
            round_bps(subtotal, self.referral_fee_bps).clamp(0, subtotal)
        } else {
            0
        };

        Ok(FeeSplit {
            product_subtotal_cents: subtotal,
            affiliate_fee_cents: input.affiliate_fee_cents.clamp(0, subtotal),
            platform_fee_cents,
            ref_or_fundraiser_fee_cents,
        })
    }

    /// Processing fee charged to the buyer so that, after the processor takes
    /// its percentage and fixed fee from the grossed-up total, `base_total_cents`
    /// remains: `ceil((pct * base + fixed) / (1 - pct))`.
    pub fn processing_fee_cents(&self, base_total_cents: i64) -> i64 {
        if base_total_cents <= 0 {
            return 0;
        }
        let bps = i128::from(self.processor_fee_bps);
        let denominator = BPS_DENOMINATOR - bps;
        if denominator <= 0 {
            return 0;
        }
        let numerator = bps * i128::from(base_total_cents)
            + i128::from(self.processor_fixed_cents.max(0)) * BPS_DENOMINATOR;
        clamp_i64((numerator + denominator - 1) / denominator)
    }

    /// A recruiter's override on one sale, never larger than the platform's own fee on it.
    pub fn referral_override_cents(&self, sale_amount_cents: i64, platform_fee_cents: i64) -> i64 {
        round_bps(sale_amount_cents.max(0), self.referral_fee_bps).min(platform_fee_cents.max(0))
    }
}
