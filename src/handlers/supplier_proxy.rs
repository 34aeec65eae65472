use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::auth::JobAccess;
use crate::{errors::ServiceError, AppState};

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub endpoint: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Relative supplier API path; absolute URLs and parent segments are refused.
pub fn validate_endpoint(raw: &str) -> Result<String, ServiceError> {
    let endpoint = raw.trim().trim_start_matches('/');
    if endpoint.is_empty() || endpoint.contains("://") || endpoint.split('/').any(|s| s == "..") {
        return Err(ServiceError::InvalidInput(format!(
            "invalid supplier endpoint `{}`",
            raw
        )));
    }
    Ok(endpoint.to_string())
}

fn parse_method(raw: Option<&str>) -> Result<Method, ServiceError> {
    match raw.map(|m| m.trim().to_ascii_uppercase()).as_deref() {
        None | Some("") | Some("POST") => Ok(Method::POST),
        Some("GET") => Ok(Method::GET),
        Some("PUT") => Ok(Method::PUT),
        Some("PATCH") => Ok(Method::PATCH),
        Some("DELETE") => Ok(Method::DELETE),
        Some(other) => Err(ServiceError::InvalidInput(format!(
            "unsupported method `{}`",
            other
        ))),
    }
}

/// POST /api/v1/supplier/proxy
///
/// Operators only. Forwards through the rate-limited supplier queue and
/// relays the supplier's status code and body.
pub async fn proxy(
    State(state): State<AppState>,
    access: JobAccess,
    Json(payload): Json<ProxyRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let endpoint = validate_endpoint(&payload.endpoint)?;
    let method = parse_method(payload.method.as_deref())?;
    debug!(?access, %endpoint, %method, "Proxying supplier request");
    let response = state
        .services
        .supplier
        .proxy(&endpoint, method, payload.body)
        .await?;
    let status = axum::http::StatusCode::from_u16(response.status.as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    Ok((status, Json(response.body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("product/list", true)]
    #[case("/shopping/order/list", true)]
    #[case("https://evil.example/x", false)]
    #[case("product/../../admin", false)]
    #[case("  ", false)]
    fn endpoints_must_be_relative(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(validate_endpoint(raw).is_ok(), ok);
    }

    #[test]
    fn method_defaults_to_post() {
        assert_eq!(parse_method(None).unwrap(), Method::POST);
        assert_eq!(parse_method(Some("get")).unwrap(), Method::GET);
        assert!(parse_method(Some("TRACE")).is_err());
    }
}
