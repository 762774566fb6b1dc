//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use devroom_auth::TokenVerifier;
use devroom_store::Store;

use crate::state::GatewayState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
    /// Open sockets.
    pub connections: usize,
    /// Rooms with at least one subscriber, per namespace.
    pub topics: usize,
    /// Deployments held in memory.
    pub deployments: usize,
}

/// Health check handler.
///
/// Public; does not require authentication.
///
/// # Example
///
/// ```text
/// GET /health
///
/// Response: 200 OK
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "connections": 3,
///   "topics": 2,
///   "deployments": 0
/// }
/// ```
pub async fn health<S, V>(State(state): State<Arc<GatewayState<S, V>>>) -> impl IntoResponse
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    let registry = state.engine.registry();
    let response = HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: registry.connection_count(),
        topics: registry.topic_count(),
        deployments: state.engine.deploy().active_count(),
    };

    (StatusCode::OK, Json(response))
}
