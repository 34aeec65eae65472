// Pricing
pub mod fees;

// Checkout and settlement
pub mod checkout_intent;
pub mod order_completion;
pub mod payment_events;

// Balances and payouts
pub mod earnings;
pub mod payouts;

// Drop-ship fulfillment
pub mod fulfillment;
pub mod supplier_events;
