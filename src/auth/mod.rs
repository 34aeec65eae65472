//! Caller identity and job authorization.
//!
//! Authentication itself happens upstream; the gateway forwards the
//! authenticated profile id in `x-caller-id`. Administrator status is never
//! taken from the request and is always read from the caller's profile row.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sea_orm::{DatabaseConnection, EntityTrait};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::profile;
use crate::errors::ServiceError;
use crate::AppState;

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const JOB_TOKEN_HEADER: &str = "x-job-token";

/// The authenticated profile making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("missing caller identity".to_string()))?;
        let user_id = Uuid::parse_str(raw)
            .map_err(|_| ServiceError::Unauthorized("malformed caller identity".to_string()))?;
        Ok(Self { user_id })
    }
}

/// How a job endpoint call was authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAccess {
    /// The shared scheduler token was presented.
    JobToken,
    /// A profile whose role is one of the configured admin roles.
    Admin(CallerIdentity),
}

impl JobAccess {
    pub fn admin_id(&self) -> Option<Uuid> {
        match self {
            Self::Admin(caller) => Some(caller.user_id),
            Self::JobToken => None,
        }
    }
}

/// Constant-time comparison of two secrets via their digests.
pub(crate) fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Whether `user_id` is a platform administrator according to its profile.
pub async fn is_admin(
    db: &DatabaseConnection,
    user_id: Uuid,
    admin_roles: &[String],
) -> Result<bool, ServiceError> {
    let profile = profile::Entity::find_by_id(user_id)
        .one(db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(profile.map(|p| p.has_role_in(admin_roles)).unwrap_or(false))
}

#[async_trait]
impl FromRequestParts<AppState> for JobAccess {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(JOB_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(presented) = presented {
            return match state.config.jobs.job_token.as_deref() {
                Some(expected) if tokens_match(presented, expected) => {
                    debug!("Job request authorized by job token");
                    Ok(Self::JobToken)
                }
                _ => {
                    warn!("Rejected job request with an invalid job token");
                    Err(ServiceError::Unauthorized("invalid job token".to_string()))
                }
            };
        }

        let caller = CallerIdentity::from_request_parts(parts, state).await?;
        if is_admin(&state.db, caller.user_id, &state.config.payouts.admin_roles).await? {
            Ok(Self::Admin(caller))
        } else {
            Err(ServiceError::Forbidden("admin only".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<CallerIdentity, ServiceError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(CALLER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CallerIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn caller_identity_requires_a_uuid_header() {
        let id = Uuid::new_v4();
        assert_eq!(extract(Some(&id.to_string())).await.unwrap().user_id, id);
        assert!(matches!(extract(None).await, Err(ServiceError::Unauthorized(_))));
        assert!(matches!(extract(Some("nope")).await, Err(ServiceError::Unauthorized(_))));
    }

    #[test]
    fn job_tokens_compare_exactly() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secret", "secret2"));
        assert!(!tokens_match("", "secret"));
    }
}
