//! Authentication extractor.
//!
//! `AuthUser` verifies the `Authorization: Bearer <token>` header and yields
//! the caller's user ID.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use devroom_auth::{TokenVerifier, VerifiedIdentity};
use devroom_core::UserId;
use devroom_store::Store;

use crate::error::ApiError;
use crate::state::GatewayState;

/// An authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    /// The verified user.
    pub user_id: UserId,
}

impl From<VerifiedIdentity> for AuthUser {
    fn from(identity: VerifiedIdentity) -> Self {
        Self {
            user_id: identity.user_id,
        }
    }
}

/// The bearer token of a request, if it carries one.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl<S, V> FromRequestParts<Arc<GatewayState<S, V>>> for AuthUser
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<GatewayState<S, V>>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let identity = state.verifier.verify(token).await?;
        Ok(Self::from(identity))
    }
}
