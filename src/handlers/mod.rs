pub mod checkout;
pub mod fulfillment;
pub mod health;
pub mod jobs;
pub mod orders;
pub mod supplier_proxy;
pub mod webhooks;

use chrono::Duration;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::clients::{PaymentProcessor, SupplierApi};
use crate::config::AppConfig;
use crate::services::checkout_intent::CheckoutService;
use crate::services::earnings::EarningsService;
use crate::services::fees::FeeSchedule;
use crate::services::fulfillment::FulfillmentService;
use crate::services::order_completion::OrderCompletionService;
use crate::services::payment_events::PaymentEventService;
use crate::services::payouts::PayoutService;
use crate::services::supplier_events::SupplierEventService;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub completion: Arc<OrderCompletionService>,
    pub fulfillment: Arc<FulfillmentService>,
    pub earnings: Arc<EarningsService>,
    pub payouts: Arc<PayoutService>,
    pub payment_events: Arc<PaymentEventService>,
    pub supplier_events: Arc<SupplierEventService>,
    pub supplier: Arc<dyn SupplierApi>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        config: &AppConfig,
        payments: Arc<dyn PaymentProcessor>,
        supplier: Arc<dyn SupplierApi>,
    ) -> Self {
        let fees = FeeSchedule::from(&config.fees);
        let checkout = CheckoutService::new(
            db_pool.clone(),
            payments.clone(),
            fees,
            config.fees.split_version.clone(),
        );
        let completion = OrderCompletionService::new(
            db_pool.clone(),
            payments.clone(),
            fees,
            Duration::days(config.payouts.seller_hold_days),
        );
        let fulfillment = FulfillmentService::new(
            db_pool.clone(),
            payments.clone(),
            supplier.clone(),
            config.supplier.default_logistic_name.clone(),
            Duration::seconds(config.supplier.claim_timeout_secs),
        );
        let payment_events = PaymentEventService::new(completion.clone(), fulfillment.clone());
        let payouts = PayoutService::new(db_pool.clone(), payments, config.payouts.clone());

        Self {
            checkout: Arc::new(checkout),
            completion: Arc::new(completion),
            fulfillment: Arc::new(fulfillment),
            earnings: Arc::new(EarningsService::new(db_pool.clone())),
            supplier_events: Arc::new(SupplierEventService::new(db_pool)),
            payouts: Arc::new(payouts),
            payment_events: Arc::new(payment_events),
            supplier,
        }
    }
}
