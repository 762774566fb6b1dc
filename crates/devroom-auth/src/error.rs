//! Authentication error types.

use thiserror::Error;

/// A result type using `AuthError`.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur during token verification.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was supplied.
    #[error("missing credential")]
    MissingToken,

    /// The JWT has expired.
    #[error("token expired")]
    TokenExpired,

    /// The JWT signature is invalid.
    #[error("invalid signature")]
    InvalidSignature,

    /// The JWT issuer does not match the expected value.
    #[error("invalid issuer")]
    InvalidIssuer,

    /// The JWT audience does not match the expected value.
    #[error("invalid audience")]
    InvalidAudience,

    /// The user ID in the `sub` claim is malformed.
    #[error("invalid user ID format")]
    InvalidUserId,

    /// A required claim is missing from the token.
    #[error("missing required claim: {0}")]
    MissingClaim(String),

    /// The token was signed with an algorithm the verifier does not accept.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Failed to fetch JWKS from the identity provider.
    #[error("JWKS fetch failed: {0}")]
    JwksFetchFailed(String),

    /// The key ID specified in the token was not found.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The token format is invalid.
    #[error("invalid token format: {0}")]
    InvalidToken(String),

    /// The verifier configuration is unusable.
    #[error("misconfigured verifier: {0}")]
    Misconfigured(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Returns `true` if this error indicates the client should retry with a new token.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::JwksFetchFailed(_))
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::MissingToken
            | Self::TokenExpired
            | Self::InvalidSignature
            | Self::InvalidIssuer
            | Self::InvalidAudience
            | Self::InvalidUserId
            | Self::MissingClaim(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::KeyNotFound(_)
            | Self::InvalidToken(_) => 401,
            Self::JwksFetchFailed(_) => 503,
            Self::Misconfigured(_) | Self::Internal(_) => 500,
        }
    }
}
