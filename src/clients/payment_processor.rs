use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::PaymentConfig;
use crate::errors::ServiceError;

#[derive(Debug, Error)]
pub enum PaymentProcessorError {
    #[error("payment processor is not configured")]
    NotConfigured,

    #[error("payment processor request failed: {0}")]
    Http(String),

    #[error("payment processor returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected payment processor response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PaymentProcessorError {
    fn from(err: reqwest::Error) -> Self {
        PaymentProcessorError::Http(err.to_string())
    }
}

impl From<PaymentProcessorError> for ServiceError {
    fn from(err: PaymentProcessorError) -> Self {
        match err {
            PaymentProcessorError::NotConfigured => {
                ServiceError::ServiceUnavailable(err.to_string())
            }
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

/// One row of the hosted checkout page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLineItem {
    pub name: String,
    pub quantity: i32,
    pub unit_amount_cents: i64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionRequest {
    pub currency: String,
    pub line_items: Vec<SessionLineItem>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub status: String,
}

/// What the processor reports about a payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentStatus {
    pub status: String,
    pub amount_received_cents: i64,
    /// `checkout_intent_id` metadata attached at session creation
    pub checkout_intent_id: Option<String>,
}

impl PaymentIntentStatus {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub destination_account: String,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
}

/// The operations the settlement core needs from a card processor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentProcessorError>;

    /// Refunds a captured payment in full.
    async fn refund(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<Refund, PaymentProcessorError>;

    async fn payment_status(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentStatus, PaymentProcessorError>;

    /// When the charge behind a payment settles into the platform balance.
    /// `None` when the processor has not reported a date yet.
    async fn funds_available_on(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PaymentProcessorError>;

    /// Available platform balance in `currency`, in cents.
    async fn available_balance(&self, currency: &str) -> Result<i64, PaymentProcessorError>;

    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<Transfer, PaymentProcessorError>;
}

/// Stripe REST client (form-encoded requests, basic auth with the secret key).
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: Option<String>,
}

impl StripeClient {
    pub fn new(cfg: &PaymentConfig) -> Result<Self, PaymentProcessorError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            secret_key: cfg
                .secret_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
        })
    }

    fn key(&self) -> Result<&str, PaymentProcessorError> {
        self.secret_key
            .as_deref()
            .ok_or(PaymentProcessorError::NotConfigured)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path.trim_start_matches('/'))
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Value, PaymentProcessorError> {
        let mut request = self
            .http
            .post(self.url(path))
            .basic_auth(self.key()?, Some(""))
            .form(params);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        Self::read_json(path, request.send().await?).await
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, PaymentProcessorError> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(self.key()?, Some(""))
            .query(query)
            .send()
            .await?;
        Self::read_json(path, response).await
    }

    async fn read_json(path: &str, response: reqwest::Response) -> Result<Value, PaymentProcessorError> {
        let status = response.status();
        counter!("settlement.payment_processor.requests", 1, "status" => status.as_u16().to_string());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            warn!(path, status = status.as_u16(), %message, "Payment processor request rejected");
            return Err(PaymentProcessorError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| PaymentProcessorError::Decode(e.to_string()))
    }
}

fn required_str(value: &Value, field: &str) -> Result<String, PaymentProcessorError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PaymentProcessorError::Decode(format!("missing `{}`", field)))
}

/// Flattens a checkout session into Stripe's bracketed form keys.
fn session_form(request: &CheckoutSessionRequest) -> Vec<(String, String)> {
    let currency = request.currency.to_lowercase();
    let mut params = vec![
        ("mode".to_string(), "payment".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
    ];
    for (i, item) in request.line_items.iter().enumerate() {
        let prefix = format!("line_items[{}]", i);
        params.push((format!("{}[quantity]", prefix), item.quantity.to_string()));
        params.push((format!("{}[price_data][currency]", prefix), currency.clone()));
        params.push((
            format!("{}[price_data][unit_amount]", prefix),
            item.unit_amount_cents.to_string(),
        ));
        params.push((
            format!("{}[price_data][product_data][name]", prefix),
            item.name.clone(),
        ));
        for (key, value) in &item.metadata {
            params.push((
                format!("{}[price_data][product_data][metadata][{}]", prefix, key),
                value.clone(),
            ));
        }
    }
    for (key, value) in &request.metadata {
        params.push((format!("metadata[{}]", key), value.clone()));
        params.push((format!("payment_intent_data[metadata][{}]", key), value.clone()));
    }
    params
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    #[instrument(skip(self, request), fields(items = request.line_items.len()))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, PaymentProcessorError> {
        let body = self
            .post_form("checkout/sessions", &session_form(request), None)
            .await?;
        let session = CheckoutSession {
            id: required_str(&body, "id")?,
            url: required_str(&body, "url")?,
        };
        info!(session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        payment_intent_id: &str,
        idempotency_key: &str,
    ) -> Result<Refund, PaymentProcessorError> {
        let params = vec![("payment_intent".to_string(), payment_intent_id.to_string())];
        let body = self
            .post_form("refunds", &params, Some(idempotency_key))
            .await?;
        Ok(Refund {
            id: required_str(&body, "id")?,
            status: body["status"].as_str().unwrap_or("pending").to_string(),
        })
    }

    #[instrument(skip(self))]
    #[instrument(skip(self))]
    async fn payment_status(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentStatus, PaymentProcessorError> {
        let body = self
            .get(&format!("payment_intents/{}", payment_intent_id), &[])
            .await?;
        let status = body["status"]
            .as_str()
            .ok_or_else(|| PaymentProcessorError::Decode("payment intent without status".to_string()))?;
        Ok(PaymentIntentStatus {
            status: status.to_string(),
            amount_received_cents: body["amount_received"].as_i64().unwrap_or(0),
            checkout_intent_id: body["metadata"]["checkout_intent_id"].as_str().map(str::to_string),
        })
    }

    async fn funds_available_on(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PaymentProcessorError> {
        let body = self
            .get(
                &format!("payment_intents/{}", payment_intent_id),
                &[("expand[]", "latest_charge.balance_transaction")],
            )
            .await?;
        let available_on = body["latest_charge"]["balance_transaction"]["available_on"].as_i64();
        Ok(available_on.and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
    }

    #[instrument(skip(self))]
    async fn available_balance(&self, currency: &str) -> Result<i64, PaymentProcessorError> {
        let body = self.get("balance", &[]).await?;
        let total = body["available"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| {
                        e["currency"]
                            .as_str()
                            .map(|c| c.eq_ignore_ascii_case(currency))
                            .unwrap_or(false)
                    })
                    .filter_map(|e| e["amount"].as_i64())
                    .sum()
            })
            .unwrap_or(0);
        Ok(total)
    }

    #[instrument(skip(self, request), fields(amount = request.amount_cents, destination = %request.destination_account))]
    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<Transfer, PaymentProcessorError> {
        let mut params = vec![
            ("amount".to_string(), request.amount_cents.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("destination".to_string(), request.destination_account.clone()),
        ];
        for (key, value) in &request.metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }
        let body = self
            .post_form("transfers", &params, Some(&request.idempotency_key))
            .await?;
        Ok(Transfer {
            id: required_str(&body, "id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, key: Option<&str>) -> StripeClient {
        let cfg = PaymentConfig {
            secret_key: key.map(str::to_string),
            api_base: server.uri(),
            ..PaymentConfig::default()
        };
        StripeClient::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn checkout_session_posts_line_items_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(body_string_contains("line_items%5B0%5D%5Bprice_data%5D%5Bunit_amount%5D=2500"))
            .and(body_string_contains("metadata%5Bcheckout_intent_id%5D=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_1",
                "url": "https://checkout.test/cs_test_1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut metadata = BTreeMap::new();
        metadata.insert("checkout_intent_id".to_string(), "abc".to_string());
        let session = client(&server, Some("sk_test"))
            .create_checkout_session(&CheckoutSessionRequest {
                currency: "USD".into(),
                line_items: vec![SessionLineItem {
                    name: "Mug".into(),
                    quantity: 1,
                    unit_amount_cents: 2_500,
                    metadata: BTreeMap::new(),
                }],
                success_url: "https://shop.test/ok".into(),
                cancel_url: "https://shop.test/cancel".into(),
                metadata,
            })
            .await
            .unwrap();

        assert_eq!(session.id, "cs_test_1");
        assert_eq!(session.url, "https://checkout.test/cs_test_1");
    }

    #[tokio::test]
    async fn transfer_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transfers"))
            .and(header("Idempotency-Key", "payout-B1-u1-seller"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "tr_1" })))
            .expect(1)
            .mount(&server)
            .await;

        let transfer = client(&server, Some("sk_test"))
            .create_transfer(&TransferRequest {
                amount_cents: 2_500,
                currency: "usd".into(),
                destination_account: "acct_1".into(),
                idempotency_key: "payout-B1-u1-seller".into(),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(transfer.id, "tr_1");
    }

    #[tokio::test]
    async fn funds_available_on_reads_balance_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_1"))
            .and(query_param("expand[]", "latest_charge.balance_transaction"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_1",
                "latest_charge": { "balance_transaction": { "available_on": 1_700_000_000 } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_2",
                "latest_charge": null
            })))
            .mount(&server)
            .await;

        let stripe = client(&server, Some("sk_test"));
        let on = stripe.funds_available_on("pi_1").await.unwrap();
        assert_eq!(on.map(|d| d.timestamp()), Some(1_700_000_000));
        assert_eq!(stripe.funds_available_on("pi_2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn payment_status_reads_intent_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_9",
                "status": "succeeded",
                "amount_received": 12_905,
                "metadata": { "checkout_intent_id": "abc" }
            })))
            .mount(&server)
            .await;

        let status = client(&server, Some("sk_test")).payment_status("pi_9").await.unwrap();
        assert!(status.succeeded());
        assert_eq!(status.amount_received_cents, 12_905);
        assert_eq!(status.checkout_intent_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn balance_sums_matching_currency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "available": [
                    { "amount": 1000, "currency": "usd" },
                    { "amount": 500, "currency": "eur" },
                    { "amount": 250, "currency": "usd" }
                ]
            })))
            .mount(&server)
            .await;

        let balance = client(&server, Some("sk_test"))
            .available_balance("USD")
            .await
            .unwrap();
        assert_eq!(balance, 1_250);
    }

    #[tokio::test]
    async fn api_errors_surface_the_processor_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "Charge already refunded" }
            })))
            .mount(&server)
            .await;

        let err = client(&server, Some("sk_test"))
            .refund("pi_1", "refund-1")
            .await
            .unwrap_err();
        assert_matches!(err, PaymentProcessorError::Api { status: 400, ref message } if message == "Charge already refunded");
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let server = MockServer::start().await;
        let err = client(&server, None).available_balance("usd").await.unwrap_err();
        assert_matches!(err, PaymentProcessorError::NotConfigured);
    }
}
