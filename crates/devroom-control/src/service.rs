//! The assembled engine.
//!
//! [`Engine`] owns one [`PresenceRegistry`] and hands the same presence layer
//! to every service, so collab, bridge and deploy events reach the same
//! connections.

use std::sync::Arc;

use devroom_core::{BridgeId, ConnectionId};
use devroom_store::Store;
use tokio::task::JoinHandle;

use crate::bridge::BridgeService;
use crate::collab::CollabService;
use crate::config::ControlConfig;
use crate::deploy::{DeploymentOrchestrator, ProviderRegistry};
use crate::error::Result;
use crate::presence::{Departure, Presence, PresenceRegistry};
use crate::sandbox::{CommandSandbox, ProcessSandbox};

/// What a connection teardown removed.
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    /// Bridge session ended by the disconnect.
    pub bridge_id: Option<BridgeId>,
    /// Registry entry removed by the disconnect.
    pub departure: Option<Departure>,
}

/// Presence, collaboration, bridge and deployment services sharing one registry.
pub struct Engine<S: Store> {
    presence: Arc<Presence<S>>,
    collab: CollabService<S>,
    bridge: BridgeService<S>,
    deploy: Arc<DeploymentOrchestrator<S>>,
}

impl<S: Store + 'static> Engine<S> {
    /// Build the engine with a local process sandbox and the configured
    /// deploy providers.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Internal` if a provider cannot be built.
    pub fn new(store: Arc<S>, config: ControlConfig) -> Result<Self> {
        let sandbox: Arc<dyn CommandSandbox> = Arc::new(ProcessSandbox::new(config.max_output_bytes));
        let providers = ProviderRegistry::from_config(&config)?;
        Ok(Self::with_parts(store, sandbox, providers, config))
    }

    /// Build the engine from explicit collaborators.
    #[must_use]
    pub fn with_parts(
        store: Arc<S>,
        sandbox: Arc<dyn CommandSandbox>,
        providers: ProviderRegistry,
        config: ControlConfig,
    ) -> Self {
        let presence = Arc::new(Presence::new(store, Arc::new(PresenceRegistry::new())));
        let collab = CollabService::new(Arc::clone(&presence));
        let bridge = BridgeService::new(Arc::clone(&presence), Arc::clone(&sandbox), &config);
        let deploy = Arc::new(DeploymentOrchestrator::new(
            Arc::clone(&presence),
            sandbox,
            providers,
            config,
        ));

        Self {
            presence,
            collab,
            bridge,
            deploy,
        }
    }

    /// Presence and room membership.
    #[must_use]
    pub const fn presence(&self) -> &Arc<Presence<S>> {
        &self.presence
    }

    /// The connection table.
    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        self.presence.registry()
    }

    /// Live edits and cursors.
    #[must_use]
    pub const fn collab(&self) -> &CollabService<S> {
        &self.collab
    }

    /// External editor sessions.
    #[must_use]
    pub const fn bridge(&self) -> &BridgeService<S> {
        &self.bridge
    }

    /// Deployments.
    #[must_use]
    pub const fn deploy(&self) -> &Arc<DeploymentOrchestrator<S>> {
        &self.deploy
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        self.presence.store()
    }

    /// Start background maintenance.
    pub fn spawn_background(&self) -> JoinHandle<()> {
        self.deploy.spawn_retention_sweeper()
    }

    /// Forget a connection everywhere it is known.
    ///
    /// The bridge session ends first so the room still sees the
    /// `editor-disconnected` event before `member-left`.
    pub fn disconnect(&self, conn: ConnectionId) -> Teardown {
        let bridge_id = self.bridge.disconnect(conn);
        let departure = self.presence.disconnect(conn);
        Teardown {
            bridge_id,
            departure,
        }
    }

    /// Close every connection. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let drained = self.registry().drain();
        tracing::info!(
            connections = drained,
            deployments = self.deploy.active_count(),
            "Engine shut down"
        );
        drained
    }
}
