//! CJ drop-ship supplier client.
//!
//! All traffic, including the access-token fetch, goes through [`RequestQueue`].
//! Token fetches are submitted as their own queue jobs from outside the worker,
//! so no job ever waits on another one.

pub mod queue;
pub mod token;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Method, StatusCode};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::config::SupplierConfig;
use crate::errors::ServiceError;
pub use queue::{QueueSettings, RequestQueue};
pub use token::{parse_expiry, FetchedToken, TokenCache};

const ACCESS_TOKEN_HEADER: &str = "cj-access-token";
const SNIPPET_LEN: usize = 500;
static NULL: Value = Value::Null;

static INVALID_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)apikey\s+is\s+wrong").expect("static regex"));

#[derive(Debug, Error)]
pub enum SupplierError {
    #[error("supplier API key is not configured")]
    NotConfigured,

    #[error("supplier rate limit hit; retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("supplier rejected the API key: {0}")]
    InvalidApiKey(String),

    #[error("supplier API key rejected recently; retry in {}s", .retry_after.as_secs())]
    KeyCooldown { retry_after: Duration },

    #[error("supplier request failed: {0}")]
    Http(String),

    #[error("supplier returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected supplier response: {0}")]
    Decode(String),

    #[error("supplier request queue is closed")]
    QueueClosed,
}

impl From<reqwest::Error> for SupplierError {
    fn from(err: reqwest::Error) -> Self {
        SupplierError::Http(err.to_string())
    }
}

impl SupplierError {
    /// Deferred conditions are retried by the sweep rather than recorded as failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::KeyCooldown { .. } | Self::QueueClosed
        )
    }
}

impl From<SupplierError> for ServiceError {
    fn from(err: SupplierError) -> Self {
        match err {
            SupplierError::RateLimited { retry_after } => ServiceError::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs().max(1),
            },
            SupplierError::NotConfigured
            | SupplierError::KeyCooldown { .. }
            | SupplierError::QueueClosed => ServiceError::ServiceUnavailable(err.to_string()),
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierOrderItem {
    pub pid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    pub address2: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub order_number: String,
    pub products: Vec<SupplierOrderItem>,
    pub shipping_address: ShippingAddress,
    pub logistic_name: String,
}

/// Live stock as reported by the supplier for one product/variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventoryStatus {
    pub stock: Option<i64>,
    pub backorder: bool,
}

impl InventoryStatus {
    pub fn from_payload(payload: &Value) -> Self {
        let obj = match payload {
            Value::Array(items) => items.first().unwrap_or(&NULL),
            other => other,
        };
        if !obj.is_object() {
            return Self::default();
        }

        const STOCK_KEYS: [&str; 8] = [
            "stockNumber",
            "stock",
            "inventory",
            "qty",
            "quantity",
            "availableStock",
            "available",
            "onHand",
        ];
        const BACKORDER_KEYS: [&str; 5] = [
            "backorder",
            "isBackOrder",
            "isBackorder",
            "backOrder",
            "allowBackorder",
        ];

        let stock = STOCK_KEYS.iter().find_map(|key| match &obj[*key] {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            _ => None,
        });
        let backorder = BACKORDER_KEYS
            .iter()
            .map(|key| &obj[*key])
            .find(|v| !v.is_null())
            .map(|v| match v {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64() == Some(1),
                Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
                _ => false,
            })
            .unwrap_or(false);

        Self { stock, backorder }
    }

    /// Why `quantity` cannot be ordered right now, if it cannot.
    pub fn shortfall(&self, quantity: i32) -> Option<String> {
        if self.backorder {
            return Some("backorder".to_string());
        }
        match self.stock {
            Some(stock) if stock <= 0 => Some(format!("out of stock (stock={})", stock)),
            Some(stock) if i64::from(quantity) > stock => Some(format!(
                "insufficient stock (qty={} stock={})",
                quantity, stock
            )),
            _ => None,
        }
    }
}

/// Raw supplier reply forwarded by the proxy endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[async_trait]
pub trait SupplierApi: Send + Sync {
    async fn inventory(&self, pid: &str, vid: Option<&str>) -> Result<InventoryStatus, SupplierError>;

    /// Places the purchase; returns the supplier's order id when it reports one.
    async fn create_order(&self, order: &CreateOrderRequest) -> Result<Option<String>, SupplierError>;

    async fn proxy(&self, endpoint: &str, method: Method, body: Value) -> Result<ProxyResponse, SupplierError>;
}

pub struct SupplierClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    queue: RequestQueue,
    tokens: TokenCache,
}

/// Strips whitespace and one level of surrounding quotes from a configured key.
fn clean_api_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed)
        .trim();
    (!unquoted.is_empty()).then(|| unquoted.to_string())
}

fn snippet(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_LEN).collect()
}

impl SupplierClient {
    /// Builds the client and starts its queue worker; requires a tokio runtime.
    pub fn new(cfg: &SupplierConfig, db: Option<Arc<DatabaseConnection>>) -> Result<Self, SupplierError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        let queue = RequestQueue::spawn(http.clone(), QueueSettings::from(cfg));
        let tokens = TokenCache::new(
            db,
            ChronoDuration::seconds(cfg.token_fallback_ttl_secs),
            ChronoDuration::seconds(cfg.token_refresh_margin_secs),
        );
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.as_deref().and_then(clean_api_key),
            queue,
            tokens,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn backoff(&self) -> Duration {
        self.queue.settings().rate_limit_backoff
    }

    async fn fetch_token(&self) -> Result<FetchedToken, SupplierError> {
        let api_key = self.api_key.as_deref().ok_or(SupplierError::NotConfigured)?;
        let request = self
            .http
            .post(self.url("authentication/getAccessToken"))
            .json(&json!({ "apiKey": api_key }))
            .build()?;
        let response = self.queue.submit(request).await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SupplierError::RateLimited {
                retry_after: self.backoff(),
            });
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() || body["result"] != Value::Bool(true) {
            let message = body["message"].as_str().unwrap_or("unknown error").to_string();
            if INVALID_KEY_RE.is_match(&message) {
                error!(status = status.as_u16(), "Supplier rejected the configured API key");
                self.queue.note_invalid_key().await;
                return Err(SupplierError::InvalidApiKey(message));
            }
            return Err(SupplierError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let data = &body["data"];
        Ok(FetchedToken {
            access_token: data["accessToken"].as_str().unwrap_or_default().to_string(),
            expires_at: parse_expiry(&data["accessTokenExpiryDate"]),
        })
    }

    pub async fn access_token(&self) -> Result<String, SupplierError> {
        self.tokens.get_or_refresh(|| self.fetch_token()).await
    }

    /// Sends one authenticated request; GET bodies become query parameters.
    async fn send(&self, endpoint: &str, method: Method, body: &Value) -> Result<(StatusCode, String), SupplierError> {
        let token = self.access_token().await?;
        let mut builder = self
            .http
            .request(method.clone(), self.url(endpoint))
            .header(ACCESS_TOKEN_HEADER, token);

        if method == Method::GET {
            let query: Vec<(String, String)> = body
                .as_object()
                .map(|fields| {
                    fields
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| {
                            let value = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), value)
                        })
                        .collect()
                })
                .unwrap_or_default();
            builder = builder.query(&query);
        } else {
            let payload = if body.is_null() { json!({}) } else { body.clone() };
            builder = builder.json(&payload);
        }

        let response = self.queue.submit(builder.build()?).await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(endpoint, status = status.as_u16(), "Supplier response");
        Ok((status, text))
    }

    /// POSTs `body` and unwraps the supplier's `{ result, message, data }` envelope.
    async fn call(&self, endpoint: &str, body: &Value) -> Result<Value, SupplierError> {
        let (status, text) = self.send(endpoint, Method::POST, body).await?;
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SupplierError::RateLimited {
                retry_after: self.backoff(),
            });
        }
        let envelope: Value = serde_json::from_str(&text).map_err(|_| SupplierError::Api {
            status: status.as_u16(),
            message: format!("non-JSON response: {}", snippet(&text)),
        })?;
        if !status.is_success() || envelope["result"] != Value::Bool(true) {
            return Err(SupplierError::Api {
                status: status.as_u16(),
                message: envelope["message"]
                    .as_str()
                    .unwrap_or("request rejected")
                    .to_string(),
            });
        }
        Ok(envelope["data"].clone())
    }
}

#[async_trait]
impl SupplierApi for SupplierClient {
    #[instrument(skip(self))]
    async fn inventory(&self, pid: &str, vid: Option<&str>) -> Result<InventoryStatus, SupplierError> {
        let data = self
            .call("product/inventory/query", &json!({ "pid": pid, "vid": vid }))
            .await?;
        Ok(InventoryStatus::from_payload(&data))
    }

    #[instrument(skip(self, order), fields(order_number = %order.order_number))]
    async fn create_order(&self, order: &CreateOrderRequest) -> Result<Option<String>, SupplierError> {
        let body = serde_json::to_value(order).map_err(|e| SupplierError::Decode(e.to_string()))?;
        let data = self.call("shopping/order/createOrder", &body).await?;
        let supplier_order_id = data["cjOrderId"]
            .as_str()
            .or_else(|| data["orderId"].as_str())
            .or_else(|| data["orderNumber"].as_str())
            .map(str::to_string);
        info!(?supplier_order_id, "Supplier order created");
        Ok(supplier_order_id)
    }

    #[instrument(skip(self, body))]
    async fn proxy(&self, endpoint: &str, method: Method, body: Value) -> Result<ProxyResponse, SupplierError> {
        let (status, text) = self.send(endpoint, method, &body).await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| {
            json!({
                "result": false,
                "message": "Supplier returned non-JSON response",
                "status": status.as_u16(),
                "snippet": snippet(&text),
            })
        });
        Ok(ProxyResponse { status, body })
    }
}
