//! devroom gateway: HTTP/WebSocket entry point.
//!
//! Runs the engine in-process behind the gateway router.
//!
//! # Dev Mode
//!
//! Build with `--features dev-mode` to use a mock verifier that needs no
//! signing key. Use tokens in format: `test-token:<user-uuid>`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "dev-mode")]
use devroom_auth::MockTokenVerifier;
#[cfg(not(feature = "dev-mode"))]
use devroom_auth::{AuthConfig, JwtVerifier};
use devroom_control::{ControlConfig, Engine};
use devroom_gateway::{create_router, GatewayConfig, GatewayState};
use devroom_store::RocksStore;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn control_config() -> Result<ControlConfig, Box<dyn std::error::Error>> {
    let mut config = ControlConfig::default();
    if let Some(dir) = env_var("DEPLOY_WORK_DIR") {
        config.deploy_work_root = PathBuf::from(dir);
    }
    if let Some(dir) = env_var("DEPLOY_PUBLISH_DIR") {
        config.publish_root = PathBuf::from(dir);
    }
    if let Some(url) = env_var("DEPLOY_PUBLIC_URL") {
        config.public_base_url = url;
    }
    config.webhook_url = env_var("DEPLOY_WEBHOOK_URL");
    if let Some(seconds) = env_var("COMMAND_TIMEOUT_SECONDS") {
        config.command_timeout = Duration::from_secs(seconds.parse()?);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devroom=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting devroom gateway");

    // Load configuration from environment
    let listen_addr = env_var("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into());
    let data_dir = env_var("DATA_DIR").unwrap_or_else(|| "/data/devroom".into());
    let control_config = control_config()?;

    tracing::info!(
        listen_addr = %listen_addr,
        data_dir = %data_dir,
        work_dir = %control_config.deploy_work_root.display(),
        publish_dir = %control_config.publish_root.display(),
        webhook = control_config.webhook_url.is_some(),
        "Gateway configuration loaded"
    );

    // Initialize RocksDB store
    tracing::info!(path = %data_dir, "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&data_dir)?);

    let engine = Arc::new(Engine::new(store, control_config)?);
    let sweeper = engine.spawn_background();
    tracing::info!("Engine initialized");

    // Initialize token verifier
    #[cfg(feature = "dev-mode")]
    let verifier = {
        tracing::warn!("DEV MODE ENABLED - using mock token verifier");
        tracing::warn!("Use tokens in format: test-token:<user-uuid>");
        Arc::new(MockTokenVerifier)
    };

    #[cfg(not(feature = "dev-mode"))]
    let verifier = {
        let auth_config = AuthConfig {
            secret: env_var("AUTH_SECRET"),
            jwks_url: env_var("AUTH_JWKS_URL"),
            issuer: env_var("AUTH_ISSUER"),
            audience: env_var("AUTH_AUDIENCE"),
            ..AuthConfig::default()
        };
        Arc::new(JwtVerifier::new(auth_config)?)
    };
    tracing::info!("Token verifier initialized");

    let gateway_config = GatewayConfig {
        listen_addr: listen_addr.clone(),
        ..GatewayConfig::default()
    };
    let state = GatewayState::new(Arc::clone(&engine), verifier, gateway_config);
    let app = create_router(state);

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    sweeper.abort();
    engine.shutdown();
    Ok(())
}
