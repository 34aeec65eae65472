//! Outbound integrations: the payment processor and the drop-ship supplier.

pub mod payment_processor;
pub mod supplier;

pub use payment_processor::{PaymentProcessor, PaymentProcessorError, StripeClient};
pub use supplier::{SupplierApi, SupplierClient, SupplierError};
