//! Bearer token verification for devroom.
//!
//! Every connection and every privileged message carries a bearer credential.
//! This crate resolves such a credential to a [`VerifiedIdentity`]:
//!
//! - HS256 tokens signed with a shared secret
//! - `EdDSA` / `RS256` tokens whose keys are published on a JWKS endpoint
//!   (fetched with `reqwest`, cached with a refresh interval)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │   Gateway        │────▶│  TokenVerifier   │
//! │   (HTTP/WS)      │     │  (trait)         │
//! └──────────────────┘     └────────┬─────────┘
//!                                   │
//!                          ┌────────▼─────────┐
//!                          │   JwtVerifier    │
//!                          │   (impl)         │
//!                          └────────┬─────────┘
//!                                   │ HS256 secret, or
//!                          ┌────────▼─────────┐
//!                          │  JwksProvider    │
//!                          │  (key cache)     │
//!                          └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use devroom_auth::{AuthConfig, JwtVerifier, TokenVerifier};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = JwtVerifier::new(AuthConfig::with_secret("change-me"))?;
//!
//! let token = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9...";
//! let identity = verifier.verify(token).await?;
//!
//! println!("User ID: {}", identity.user_id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod jwks;
pub mod jwt;

pub use error::{AuthError, Result};
pub use jwt::{JwtVerifier, TokenVerifier, VerifiedIdentity};

#[cfg(any(test, feature = "test-utils"))]
pub use jwt::MockTokenVerifier;

/// Configuration for token verification.
///
/// Exactly one key source is used: `secret` wins over `jwks_url` when both are set.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// JWKS endpoint URL for asymmetric keys.
    pub jwks_url: Option<String>,
    /// Expected `iss` claim, if any.
    pub issuer: Option<String>,
    /// Expected `aud` claim, if any.
    pub audience: Option<String>,
    /// How often to refresh the JWKS cache, in seconds.
    pub jwks_refresh_seconds: u64,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_seconds: u64,
}

impl AuthConfig {
    /// Config verifying HS256 tokens with a shared secret.
    #[must_use]
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Config verifying tokens against keys published at `url`.
    #[must_use]
    pub fn with_jwks(url: impl Into<String>) -> Self {
        Self {
            jwks_url: Some(url.into()),
            ..Self::default()
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            jwks_url: None,
            issuer: None,
            audience: None,
            jwks_refresh_seconds: 300,
            leeway_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AuthConfig::default();
        assert!(config.secret.is_none());
        assert!(config.jwks_url.is_none());
        assert_eq!(config.jwks_refresh_seconds, 300);
        assert_eq!(config.leeway_seconds, 30);
    }

    #[test]
    fn config_constructors() {
        let config = AuthConfig::with_secret("s3cret");
        assert_eq!(config.secret.as_deref(), Some("s3cret"));

        let config = AuthConfig::with_jwks("https://id.example.com/.well-known/jwks.json");
        assert!(config.secret.is_none());
        assert!(config.jwks_url.is_some());
    }

    #[test]
    fn auth_error_status_codes() {
        assert_eq!(AuthError::MissingToken.http_status_code(), 401);
        assert_eq!(AuthError::TokenExpired.http_status_code(), 401);
        assert_eq!(AuthError::InvalidSignature.http_status_code(), 401);
        assert_eq!(
            AuthError::JwksFetchFailed("test".into()).http_status_code(),
            503
        );
        assert_eq!(
            AuthError::Misconfigured("test".into()).http_status_code(),
            500
        );
    }

    #[test]
    fn auth_error_retriable() {
        assert!(AuthError::TokenExpired.is_retriable());
        assert!(AuthError::JwksFetchFailed("test".into()).is_retriable());
        assert!(!AuthError::InvalidSignature.is_retriable());
        assert!(!AuthError::InvalidUserId.is_retriable());
    }
}
