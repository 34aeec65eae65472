//! Supplier access-token cache: in memory, persisted in `supplier_tokens`,
//! refreshed by at most one caller at a time.

use chrono::{DateTime, Duration, TimeZone, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::SupplierError;
use crate::entities::supplier_token::{self, SINGLETON_ID};

/// A token as returned by the supplier's auth endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenCache {
    db: Option<Arc<DatabaseConnection>>,
    current: Mutex<Option<CachedToken>>,
    refresh: Mutex<()>,
    fallback_ttl: Duration,
    refresh_margin: Duration,
}

/// Parses the supplier's expiry field. Numbers above 1e12 are epoch
/// milliseconds, smaller numbers epoch seconds; strings may hold either or an
/// RFC 3339 / `YYYY-MM-DD HH:MM:SS` date.
pub fn parse_expiry(raw: &Value) -> Option<DateTime<Utc>> {
    fn from_epoch(n: f64) -> Option<DateTime<Utc>> {
        if !n.is_finite() || n <= 0.0 {
            return None;
        }
        let millis = if n > 1e12 { n } else { n * 1000.0 };
        Utc.timestamp_millis_opt(millis as i64).single()
    }

    match raw {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
                return trimmed.parse::<f64>().ok().and_then(from_epoch);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
        _ => None,
    }
}

impl TokenCache {
    pub fn new(
        db: Option<Arc<DatabaseConnection>>,
        fallback_ttl: Duration,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            db,
            current: Mutex::new(None),
            refresh: Mutex::new(()),
            fallback_ttl,
            refresh_margin,
        }
    }

    fn usable(&self, token: &CachedToken, now: DateTime<Utc>) -> bool {
        token.expires_at > now + self.refresh_margin
    }

    async fn cached(&self) -> Option<String> {
        let now = Utc::now();
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|t| self.usable(t, now))
            .map(|t| t.access_token.clone())
    }

    /// Returns a usable token, calling `fetch` only when neither memory nor the
    /// persisted row has one. Concurrent callers share a single fetch.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, SupplierError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedToken, SupplierError>>,
    {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;
        if let Some(token) = self.cached().await {
            debug!("Supplier token refreshed by a concurrent caller");
            return Ok(token);
        }

        if let Some(persisted) = self.load_persisted().await {
            if self.usable(&persisted, Utc::now()) {
                debug!("Using persisted supplier token");
                let token = persisted.access_token.clone();
                *self.current.lock().await = Some(persisted);
                return Ok(token);
            }
        }

        info!("Fetching new supplier access token");
        let fetched = fetch().await?;
        if fetched.access_token.trim().is_empty() {
            return Err(SupplierError::Decode(
                "access token missing from auth response".to_string(),
            ));
        }
        let token = CachedToken {
            access_token: fetched.access_token,
            expires_at: fetched
                .expires_at
                .unwrap_or_else(|| Utc::now() + self.fallback_ttl),
        };
        self.persist(&token).await;
        let access_token = token.access_token.clone();
        *self.current.lock().await = Some(token);
        Ok(access_token)
    }

    /// Drops the in-memory token so the next call re-reads or refetches it.
    pub async fn clear(&self) {
        *self.current.lock().await = None;
    }

    async fn load_persisted(&self) -> Option<CachedToken> {
        let db = self.db.as_ref()?;
        match supplier_token::Entity::find_by_id(SINGLETON_ID).one(&**db).await {
            Ok(row) => row.map(|r| CachedToken {
                access_token: r.access_token,
                expires_at: r.expires_at,
            }),
            Err(e) => {
                warn!(error = %e, "Supplier token cache read failed");
                None
            }
        }
    }

    async fn persist(&self, token: &CachedToken) {
        let Some(db) = self.db.as_ref() else {
            return;
        };
        let row = supplier_token::ActiveModel {
            id: Set(SINGLETON_ID),
            access_token: Set(token.access_token.clone()),
            expires_at: Set(token.expires_at),
            updated_at: Set(Utc::now()),
        };
        let upsert = supplier_token::Entity::insert(row)
            .on_conflict(
                OnConflict::column(supplier_token::Column::Id)
                    .update_columns([
                        supplier_token::Column::AccessToken,
                        supplier_token::Column::ExpiresAt,
                        supplier_token::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&**db)
            .await;
        if let Err(e) = upsert {
            warn!(error = %e, "Supplier token cache write failed");
        }
    }
}
