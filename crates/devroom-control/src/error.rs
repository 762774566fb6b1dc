//! Error types for the engine.
//!
//! Every operation failure is scoped to the caller: it becomes an `error`
//! reply on the socket (or an HTTP error body), never a dropped connection.

use std::fmt;

use devroom_core::ConnectionId;
use devroom_store::StoreError;
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The connection has no verified identity yet.
    #[error("authentication required")]
    Unauthenticated,

    /// The caller may not perform the operation in this room.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request payload is malformed or violates a rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist (or is not visible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// A process or provider step failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The operation does not apply to the entity's current state.
    #[error("not applicable: {0}")]
    NotApplicable(String),

    /// The connection disconnected while the operation was in flight.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] devroom_auth::AuthError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Stable machine-readable code sent to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated | Self::Auth(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Execution(_) => "execution_failed",
            Self::NotApplicable(_) => "not_applicable",
            Self::ConnectionClosed(_) | Self::Store(_) | Self::Internal(_) => "internal",
        }
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => 401,
            Self::Auth(e) => e.http_status_code(),
            Self::Forbidden(_) => 403,
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::NotApplicable(_) => 409,
            Self::ConnectionClosed(_) => 410,
            Self::Execution(_) => 502,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Internal(_))
    }

    /// Map a store error about `what`, turning store-level absence and
    /// uniqueness violations into caller-facing errors.
    pub(crate) fn from_store(e: StoreError, what: impl fmt::Display) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound(what.to_string()),
            StoreError::AlreadyExists(key) => Self::Validation(format!("{key} already exists")),
            other => Self::Store(other),
        }
    }
}

impl From<devroom_core::CoreError> for ControlError {
    fn from(e: devroom_core::CoreError) -> Self {
        Self::Validation(e.to_string())
    }
}
