pub mod checkout_intent;
pub mod commission;
pub mod order;
pub mod order_item;
pub mod payment_distribution;
pub mod payout;
pub mod payout_batch;
pub mod product;
pub mod product_variant;
pub mod profile;
pub mod recruiter_earning;
pub mod supplier_order;
pub mod supplier_token;
pub mod user_earning;
