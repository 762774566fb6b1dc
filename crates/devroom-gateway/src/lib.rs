//! HTTP and WebSocket gateway for devroom.
//!
//! This crate is the public surface of the engine. It handles:
//!
//! - Bearer token verification at upgrade, per message and per request
//! - One room socket per namespace (`collab`, `bridge`, `deploy`)
//! - REST endpoints for deployment status, cancellation and history
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Clients                            │
//! │           (browser / editor bridge / HTTP callers)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      devroom-gateway                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │   Auth      │ │   Router    │ │    Room sockets     │    │
//! │  │  Extractor  │ │  + Handlers │ │    (per namespace)  │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │  Engine  │   │  Auth    │   │  Store   │
//!        │ (control)│   │  (JWT)   │   │ (RocksDB)│
//!        └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use devroom_auth::{AuthConfig, JwtVerifier};
//! use devroom_control::{ControlConfig, Engine};
//! use devroom_gateway::{create_router, GatewayConfig, GatewayState};
//! use devroom_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/devroom")?);
//! let engine = Arc::new(Engine::new(store, ControlConfig::default())?);
//! let verifier = Arc::new(JwtVerifier::new(AuthConfig::with_secret("dev-secret"))?);
//!
//! let state = GatewayState::new(engine, verifier, GatewayConfig::default());
//! let app = create_router(state);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::ApiError;
pub use protocol::{ClientMessage, ClientOp, Reply};
pub use routes::create_router;
pub use state::GatewayState;

// Re-export key types for convenience
pub use auth::AuthUser;
