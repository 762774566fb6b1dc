//! Core types and utilities for devroom.
//!
//! This crate provides the foundational types used throughout the devroom engine:
//!
//! - **Identifiers**: Strongly-typed IDs for users, rooms, projects, files,
//!   deployments, connections and bridge sessions
//! - **Paths**: Normalization of project-relative file paths
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use devroom_core::{normalize_path, ContentHash, RoomId};
//!
//! let room_id: RoomId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
//! assert_eq!(room_id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
//!
//! assert_eq!(normalize_path("./src/lib.rs").unwrap(), "src/lib.rs");
//! assert_eq!(ContentHash::of("hello").to_hex().len(), 64);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod path;

pub use error::{CoreError, Result};
pub use ids::{
    BridgeId, ConnectionId, ContentHash, DeploymentId, FileId, IdError, ProjectId, RecordId,
    RoomId, UserId,
};
pub use path::normalize_path;
