//! Applies verified payment processor events to checkouts and orders.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::fulfillment::FulfillmentService;
use crate::services::order_completion::{CompletionRequest, OrderCompletionService};
use crate::webhooks::PaymentEvent;

/// What a webhook delivery resulted in. Always acknowledged with 200 so the
/// processor stops retrying deliveries that were understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EventDisposition {
    Completed { order_id: Uuid, already_processed: bool },
    /// Stock ran out and the charge was handled by refund
    OutOfStock { order_id: Option<Uuid>, refunded: bool },
    MarkedFailed { orders: u64 },
    Ignored { reason: String },
}

#[derive(Clone)]
pub struct PaymentEventService {
    completion: OrderCompletionService,
    fulfillment: FulfillmentService,
}

impl PaymentEventService {
    pub fn new(completion: OrderCompletionService, fulfillment: FulfillmentService) -> Self {
        Self {
            completion,
            fulfillment,
        }
    }

    #[instrument(skip(self, event))]
    pub async fn apply(&self, event: PaymentEvent) -> Result<EventDisposition, ServiceError> {
        match event {
            PaymentEvent::CheckoutSessionCompleted {
                session_id,
                checkout_intent_id,
                payment_intent_id,
                amount_total_cents,
                billing_email,
                billing_name,
                shipping_address,
            } => {
                let Some(payment_intent_id) = payment_intent_id else {
                    return Ok(ignored("session completed without a payment reference"));
                };
                let Some(intent_id) = checkout_intent_id else {
                    return Ok(ignored("session carries no checkout intent"));
                };
                self.completion
                    .record_payment_reference(intent_id, Some(&session_id), &payment_intent_id)
                    .await?;
                self.settle(CompletionRequest {
                    checkout_intent_id: intent_id,
                    payment_intent_id,
                    declared_total_cents: amount_total_cents,
                    billing_email,
                    billing_name,
                    shipping_address,
                })
                .await
            }
            PaymentEvent::PaymentSucceeded {
                payment_intent_id,
                checkout_intent_id,
                amount_cents,
            } => {
                let intent_id = match checkout_intent_id {
                    Some(id) => Some(id),
                    None => self
                        .completion
                        .intent_for_payment(&payment_intent_id)
                        .await?
                        .map(|intent| intent.id),
                };
                let Some(intent_id) = intent_id else {
                    return Ok(ignored("payment does not belong to a known checkout"));
                };
                self.completion
                    .record_payment_reference(intent_id, None, &payment_intent_id)
                    .await?;
                self.settle(CompletionRequest {
                    checkout_intent_id: intent_id,
                    payment_intent_id,
                    declared_total_cents: amount_cents,
                    ..CompletionRequest::default()
                })
                .await
            }
            PaymentEvent::PaymentFailed {
                payment_intent_id,
                reason,
                ..
            } => {
                let orders = self
                    .completion
                    .mark_payment_failed(&payment_intent_id, reason.as_deref())
                    .await?;
                Ok(EventDisposition::MarkedFailed { orders })
            }
            PaymentEvent::Ignored { event_type } => {
                debug!(%event_type, "Ignoring payment event");
                Ok(ignored(&format!("unhandled event type {}", event_type)))
            }
        }
    }

    async fn settle(&self, request: CompletionRequest) -> Result<EventDisposition, ServiceError> {
        match self.completion.complete(request).await {
            Ok(result) => {
                if !result.already_processed {
                    self.spawn_fulfillment(result.order_id);
                }
                Ok(EventDisposition::Completed {
                    order_id: result.order_id,
                    already_processed: result.already_processed,
                })
            }
            Err(ServiceError::OutOfStock(conflict)) => Ok(EventDisposition::OutOfStock {
                order_id: conflict.order_id,
                refunded: conflict.refunded,
            }),
            Err(e) => Err(e),
        }
    }

    fn spawn_fulfillment(&self, order_id: Uuid) {
        let fulfillment = self.fulfillment.clone();
        tokio::spawn(async move {
            match fulfillment.fulfill(order_id).await {
                Ok(outcome) => info!(%order_id, ?outcome, "Post-payment fulfillment attempt"),
                Err(e) => warn!(%order_id, error = %e, "Post-payment fulfillment attempt failed"),
            }
        });
    }
}

fn ignored(reason: &str) -> EventDisposition {
    EventDisposition::Ignored {
        reason: reason.to_string(),
    }
}
