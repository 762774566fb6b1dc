//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use devroom_auth::TokenVerifier;
use devroom_store::Store;

use crate::handlers::{deployments, health, ws};
use crate::state::GatewayState;

/// Create the gateway router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Deployments (authenticated)
/// - `GET /v1/deployments/:deployment_id` - Live status
/// - `POST /v1/deployments/:deployment_id/cancel` - Cancel
/// - `GET /v1/projects/:project_id/deployments` - History
/// - `POST /v1/projects/:project_id/deployments` - Start
///
/// ## Sockets
/// - `GET /v1/ws/:namespace` - `collab`, `bridge` or `deploy`
pub fn create_router<S, V>(state: GatewayState<S, V>) -> Router
where
    S: Store + 'static,
    V: TokenVerifier + 'static,
{
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = state.config.request_timeout();

    let cors = build_cors_layer(&cors_origins);
    let state = Arc::new(state);

    // The request timeout would cut long-lived sockets, so it only wraps HTTP.
    let http = Router::new()
        .route("/health", get(health::health::<S, V>))
        .route(
            "/v1/deployments/:deployment_id",
            get(deployments::get_deployment::<S, V>),
        )
        .route(
            "/v1/deployments/:deployment_id/cancel",
            post(deployments::cancel_deployment::<S, V>),
        )
        .route(
            "/v1/projects/:project_id/deployments",
            get(deployments::list_deployments::<S, V>)
                .post(deployments::start_deployment::<S, V>),
        )
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/v1/ws/:namespace", get(ws::websocket_handler::<S, V>))
        .merge(http)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(max_body_bytes))
                .layer(cors)
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
