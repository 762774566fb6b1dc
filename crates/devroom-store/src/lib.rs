//! `RocksDB` storage layer for devroom.
//!
//! This crate is the durable store behind the collaboration engine: users,
//! rooms and memberships, projects, file snapshots, cursors, bridge sessions,
//! deployments and the git/command audit log. Values are CBOR-encoded and kept
//! in one column family per record kind.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `users`, `rooms`, `projects`: primary records keyed by ID
//! - `room_members`: memberships keyed by `room_id || user_id`
//! - `files`: file snapshots keyed by `file_id`
//! - `files_by_path`: unique `project_id || path` index
//! - `cursors`: live cursors keyed by `file_id || user_id`
//! - `bridges`: external editor sessions
//! - `deployments`, `deployments_by_project`: deployment records and index
//! - `operations`: append-only audit records keyed by `project_id || record_id`
//!
//! # Example
//!
//! ```no_run
//! use devroom_store::{RocksStore, Store};
//! use devroom_core::ProjectId;
//!
//! let store = RocksStore::open("/tmp/devroom-db").unwrap();
//!
//! let project_id = ProjectId::generate();
//! let files = store.list_files(&project_id).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    BridgeConnection, BridgeStatus, Cursor, DeployLogLine, Deployment, DeploymentConfig,
    DeploymentStatus, FileRecord, MemberRole, OperationKind, OperationRecord, Project, PublicUser,
    Room, RoomMember, Selection, User,
};

use devroom_core::{BridgeId, DeploymentId, FileId, ProjectId, RoomId, UserId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer so the engine can be exercised
/// against any transactional key-value backend.
pub trait Store: Send + Sync {
    // =========================================================================
    // Users, rooms and projects
    // =========================================================================

    /// Insert or update a user record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_user(&self, user: &User) -> Result<()>;

    /// Get a user by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_user(&self, user_id: &UserId) -> Result<Option<User>>;

    /// Insert or update a room record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_room(&self, room: &Room) -> Result<()>;

    /// Get a room by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>>;

    /// Insert or update a room membership.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_room_member(&self, member: &RoomMember) -> Result<()>;

    /// Get a single membership.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_room_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<RoomMember>>;

    /// List all members of a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_room_members(&self, room_id: &RoomId) -> Result<Vec<RoomMember>>;

    /// Insert or update a project record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_project(&self, project: &Project) -> Result<()>;

    /// Get a project by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_project(&self, project_id: &ProjectId) -> Result<Option<Project>>;

    // =========================================================================
    // Files and cursors
    // =========================================================================

    /// Create a new file, enforcing path uniqueness within the project.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the project already has a file at that path.
    fn create_file(&self, file: &FileRecord) -> Result<()>;

    /// Replace an existing file snapshot. The whole record is overwritten.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the file doesn't exist.
    fn put_file(&self, file: &FileRecord) -> Result<()>;

    /// Get a file by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_file(&self, file_id: &FileId) -> Result<Option<FileRecord>>;

    /// Get a file by its normalized path inside a project.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_file_by_path(&self, project_id: &ProjectId, path: &str) -> Result<Option<FileRecord>>;

    /// Delete a file, its path index entry and every cursor in it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the file doesn't exist.
    fn delete_file(&self, file_id: &FileId) -> Result<FileRecord>;

    /// List every file of a project, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_files(&self, project_id: &ProjectId) -> Result<Vec<FileRecord>>;

    /// Insert or overwrite the cursor of `(cursor.user_id, cursor.file_id)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_cursor(&self, cursor: &Cursor) -> Result<()>;

    /// List the cursors currently stored for a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_cursors(&self, file_id: &FileId) -> Result<Vec<Cursor>>;

    // =========================================================================
    // Bridge sessions
    // =========================================================================

    /// Insert or update a bridge session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_bridge(&self, bridge: &BridgeConnection) -> Result<()>;

    /// Get a bridge session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_bridge(&self, bridge_id: &BridgeId) -> Result<Option<BridgeConnection>>;

    /// Update a bridge session's status, stamping `last_sync_at` when it
    /// returns to `Connected` from `Syncing`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the session doesn't exist.
    fn update_bridge_status(&self, bridge_id: &BridgeId, status: BridgeStatus) -> Result<()>;

    // =========================================================================
    // Deployments and audit
    // =========================================================================

    /// Insert or update a deployment record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Get a deployment by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_deployment(&self, deployment_id: &DeploymentId) -> Result<Option<Deployment>>;

    /// List a project's deployments, newest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_deployments_by_project(
        &self,
        project_id: &ProjectId,
        limit: usize,
    ) -> Result<Vec<Deployment>>;

    /// Append an audit record. Records are never updated.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the record ID is reused.
    fn append_operation(&self, record: &OperationRecord) -> Result<()>;

    /// List a project's audit records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_operations(&self, project_id: &ProjectId) -> Result<Vec<OperationRecord>>;
}
