//! Gateway application state.

use std::sync::Arc;

use devroom_auth::TokenVerifier;
use devroom_control::Engine;
use devroom_store::Store;

use crate::config::GatewayConfig;

/// Shared application state for the gateway.
pub struct GatewayState<S, V>
where
    S: Store,
    V: TokenVerifier,
{
    /// The engine every socket and route talks to.
    pub engine: Arc<Engine<S>>,
    /// Bearer token verifier.
    pub verifier: Arc<V>,
    /// Gateway configuration.
    pub config: GatewayConfig,
}

impl<S, V> GatewayState<S, V>
where
    S: Store,
    V: TokenVerifier,
{
    /// Create a new gateway state.
    #[must_use]
    pub fn new(engine: Arc<Engine<S>>, verifier: Arc<V>, config: GatewayConfig) -> Self {
        Self {
            engine,
            verifier,
            config,
        }
    }
}

impl<S, V> Clone for GatewayState<S, V>
where
    S: Store,
    V: TokenVerifier,
{
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            verifier: Arc::clone(&self.verifier),
            config: self.config.clone(),
        }
    }
}
