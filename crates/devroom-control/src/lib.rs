//! Real-time engine for devroom.
//!
//! This crate holds everything between the socket and the store: room
//! presence, live collaboration, the external-editor bridge, and the
//! deployment orchestrator. Transport is the gateway's job; every operation
//! here takes a [`ConnectionId`] (or a verified [`UserId`]) and returns a
//! typed result or a [`ControlError`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Gateway (HTTP / WebSocket)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │   Collab    │ │   Bridge    │ │     Deployment      │    │
//! │  │ Broadcaster │ │ Reconciler  │ │    Orchestrator     │    │
//! │  └──────┬──────┘ └──────┬──────┘ └──────────┬──────────┘    │
//! │         └───────────────┼───────────────────┘               │
//! │                ┌────────▼─────────┐                         │
//! │                │ Presence Registry│                         │
//! │                └──────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │  Store   │   │ Sandbox  │   │ Deploy   │
//!        │ (RocksDB)│   │ (process)│   │ provider │
//!        └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use devroom_control::{ControlConfig, Engine, Topic};
//! use devroom_store::RocksStore;
//! use devroom_core::{RoomId, UserId};
//!
//! # fn example(user_id: UserId, room_id: RoomId) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/devroom")?);
//! let engine = Engine::new(store, ControlConfig::default())?;
//!
//! // One outbound queue per socket
//! let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//! let conn = engine.registry().connect(tx);
//! engine.presence().authenticate(conn, &user_id)?;
//!
//! let membership = engine.presence().join(conn, Topic::collab(room_id))?;
//! println!("{} members present", membership.members.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Deployment states
//!
//! - `Pending` → `Building` → `Deploying` → `Success`
//! - `Building` or `Deploying` → `Failed` on a fault
//! - `Pending` or `Building` → `Failed` on cancellation
//!
//! See [`deploy::lifecycle`] for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod access;
pub mod bridge;
pub mod collab;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod presence;
pub mod sandbox;
pub mod service;

#[cfg(test)]
mod test_support;

pub use access::RoomAccess;
pub use bridge::{
    BridgeService, CommandResult, ExecuteCommand, GitRequest, PullFiles, PulledFile,
    RegisterBridge, Registration, SyncFile, SyncFiles, SyncOutcome, SyncResult,
};
pub use collab::{CodeChange, CollabService, ConflictResolver, CursorMove, LastWriteWins, NewFile};
pub use config::{ControlConfig, DEFAULT_ALLOWED_COMMANDS};
pub use deploy::{DeploymentOrchestrator, ProviderRegistry, StartDeployment};
pub use error::{ControlError, Result};
pub use events::{Namespace, ServerEvent, Topic};
pub use presence::{Membership, Outbox, Presence, PresenceRegistry};
pub use sandbox::{CommandOutput, CommandSandbox, CommandSpec, ProcessSandbox};
pub use service::{Engine, Teardown};

// Re-export commonly used types from dependencies for convenience
pub use devroom_core::{ConnectionId, DeploymentId, FileId, ProjectId, RoomId, UserId};
pub use devroom_store::{Deployment, DeploymentStatus, FileRecord, PublicUser};
