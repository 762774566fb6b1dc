//! JWT verification and identity extraction.
//!
//! This module provides the core verification logic: signature check against
//! either a shared secret or a JWKS key, expiry, optional issuer and audience.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use devroom_core::UserId;

use crate::error::{AuthError, Result};
use crate::jwks::JwksProvider;
use crate::AuthConfig;

/// The identity a verified credential resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// The user ID taken from the `sub` claim.
    pub user_id: UserId,
    /// When the credential expires.
    pub expires_at: DateTime<Utc>,
}

/// Trait for resolving bearer credentials to users.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a credential and resolve its user.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid, expired, or cannot be verified.
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity>;
}

/// Raw claims from a JWT before validation.
#[derive(Debug, Deserialize)]
struct RawClaims {
    /// Subject (`user_id` as UUID string)
    sub: String,
    /// Expiration timestamp
    exp: u64,
}

enum KeySource {
    Secret(DecodingKey),
    Jwks(JwksProvider),
}

/// JWT verifier backed by a shared secret or a JWKS endpoint.
pub struct JwtVerifier {
    config: AuthConfig,
    keys: KeySource,
}

impl JwtVerifier {
    /// Create a verifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Misconfigured` if neither a secret nor a JWKS URL is set.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let keys = if let Some(secret) = config.secret.as_deref() {
            if secret.is_empty() {
                return Err(AuthError::Misconfigured("empty HS256 secret".to_string()));
            }
            KeySource::Secret(DecodingKey::from_secret(secret.as_bytes()))
        } else if let Some(url) = config.jwks_url.as_deref() {
            KeySource::Jwks(JwksProvider::new(
                url,
                Duration::from_secs(config.jwks_refresh_seconds),
            )?)
        } else {
            return Err(AuthError::Misconfigured(
                "either a secret or a JWKS URL is required".to_string(),
            ));
        };

        Ok(Self { config, keys })
    }

    /// Get the JWKS provider, when the verifier uses one.
    #[must_use]
    pub const fn jwks(&self) -> Option<&JwksProvider> {
        match &self.keys {
            KeySource::Jwks(provider) => Some(provider),
            KeySource::Secret(_) => None,
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.config.leeway_seconds;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let token_data = match &self.keys {
            KeySource::Secret(key) => {
                if header.alg != Algorithm::HS256 {
                    return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
                }
                decode::<RawClaims>(token, key, &self.validation(Algorithm::HS256))
            }
            KeySource::Jwks(provider) => {
                let kid = header
                    .kid
                    .ok_or_else(|| AuthError::MissingClaim("kid".to_string()))?;
                let key = provider.get_key(&kid).await?;
                if header.alg != key.algorithm {
                    return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
                }
                decode::<RawClaims>(token, &key.key, &self.validation(key.algorithm))
            }
        }
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            jsonwebtoken::errors::ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) => {
                AuthError::MissingClaim(claim.clone())
            }
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        let claims = token_data.claims;

        let user_id = UserId::from_str(&claims.sub).map_err(|_| AuthError::InvalidUserId)?;

        let exp_secs = i64::try_from(claims.exp).unwrap_or(i64::MAX);
        let expires_at = DateTime::from_timestamp(exp_secs, 0)
            .ok_or_else(|| AuthError::InvalidToken("invalid exp timestamp".to_string()))?;

        Ok(VerifiedIdentity {
            user_id,
            expires_at,
        })
    }
}

/// A mock verifier for testing.
///
/// Accepts any token in the format `test-token:<user_uuid>`.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MockTokenVerifier;

#[cfg(any(test, feature = "test-utils"))]
impl MockTokenVerifier {
    /// Build the token the mock accepts for `user_id`.
    #[must_use]
    pub fn token_for(user_id: &UserId) -> String {
        format!("test-token:{user_id}")
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl TokenVerifier for MockTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let rest = token
            .strip_prefix("test-token:")
            .ok_or_else(|| AuthError::InvalidToken("expected test-token:<user>".to_string()))?;

        let user_id = UserId::from_str(rest).map_err(|_| AuthError::InvalidUserId)?;

        Ok(VerifiedIdentity {
            user_id,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}
