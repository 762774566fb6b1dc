//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// User records, keyed by `user_id`.
    pub const USERS: &str = "users";

    /// Room records, keyed by `room_id`.
    pub const ROOMS: &str = "rooms";

    /// Room memberships, keyed by `room_id || user_id`.
    pub const ROOM_MEMBERS: &str = "room_members";

    /// Project records, keyed by `project_id`.
    pub const PROJECTS: &str = "projects";

    /// File snapshots, keyed by `file_id`.
    pub const FILES: &str = "files";

    /// Unique index: `project_id || path` to `file_id`.
    pub const FILES_BY_PATH: &str = "files_by_path";

    /// Live cursors, keyed by `file_id || user_id`.
    pub const CURSORS: &str = "cursors";

    /// Bridge sessions, keyed by `bridge_id`.
    pub const BRIDGES: &str = "bridges";

    /// Deployment records, keyed by `deployment_id`.
    pub const DEPLOYMENTS: &str = "deployments";

    /// Index: deployments by project, keyed by `project_id || deployment_id`.
    pub const DEPLOYMENTS_BY_PROJECT: &str = "deployments_by_project";

    /// Audit records, keyed by `project_id || record_id`.
    pub const OPERATIONS: &str = "operations";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::USERS,
        cf::ROOMS,
        cf::ROOM_MEMBERS,
        cf::PROJECTS,
        cf::FILES,
        cf::FILES_BY_PATH,
        cf::CURSORS,
        cf::BRIDGES,
        cf::DEPLOYMENTS,
        cf::DEPLOYMENTS_BY_PROJECT,
        cf::OPERATIONS,
    ]
}
