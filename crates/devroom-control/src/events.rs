//! Outbound room events.
//!
//! Events mirror the operation that caused them, always carry a timestamp and,
//! where a person caused them, the actor's [`PublicUser`]. They serialize as
//! `{"type": "<kebab-case>", ...camelCase fields}`.

use std::fmt;

use chrono::{DateTime, Utc};
use devroom_core::{BridgeId, DeploymentId, FileId, ProjectId, RoomId};
use devroom_store::{DeploymentStatus, FileRecord, OperationKind, PublicUser, Selection};
use serde::{Deserialize, Serialize};

/// The concern a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Browser collaboration: edits, cursors, file lifecycle.
    Collab,
    /// External editor bridge sessions.
    Bridge,
    /// Deployment progress.
    Deploy,
}

impl Namespace {
    /// All namespaces, in routing order.
    pub const ALL: [Self; 3] = [Self::Collab, Self::Bridge, Self::Deploy];

    /// Path segment and log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collab => "collab",
            Self::Bridge => "bridge",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of broadcast: one room seen through one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    /// Namespace.
    pub namespace: Namespace,
    /// Room.
    pub room_id: RoomId,
}

impl Topic {
    /// Create a topic.
    #[must_use]
    pub const fn new(namespace: Namespace, room_id: RoomId) -> Self {
        Self { namespace, room_id }
    }

    /// Shorthand for the collab topic of a room.
    #[must_use]
    pub const fn collab(room_id: RoomId) -> Self {
        Self::new(Namespace::Collab, room_id)
    }

    /// Shorthand for the bridge topic of a room.
    #[must_use]
    pub const fn bridge(room_id: RoomId) -> Self {
        Self::new(Namespace::Bridge, room_id)
    }

    /// Shorthand for the deploy topic of a room.
    #[must_use]
    pub const fn deploy(room_id: RoomId) -> Self {
        Self::new(Namespace::Deploy, room_id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.room_id)
    }
}

/// File metadata included in lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    /// File ID.
    pub id: FileId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Normalized path.
    pub path: String,
    /// Full content.
    pub content: String,
    /// Last accepted write.
    pub updated_at: DateTime<Utc>,
}

impl From<&FileRecord> for FileView {
    fn from(file: &FileRecord) -> Self {
        Self {
            id: file.file_id,
            project_id: file.project_id,
            path: file.path.clone(),
            content: file.content.clone(),
            updated_at: file.updated_at,
        }
    }
}

/// Everything the server pushes to room subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A user joined the room.
    MemberJoined {
        /// Room.
        room_id: RoomId,
        /// Who joined.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A user left the room or disconnected.
    MemberLeft {
        /// Room.
        room_id: RoomId,
        /// Who left.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A file's content was replaced.
    CodeChange {
        /// Room.
        room_id: RoomId,
        /// File.
        file_id: FileId,
        /// New full content.
        content: String,
        /// Advisory edit metadata, relayed verbatim.
        change_ops: serde_json::Value,
        /// Author.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A cursor moved.
    CursorUpdate {
        /// Room.
        room_id: RoomId,
        /// File.
        file_id: FileId,
        /// Absolute offset.
        position: u64,
        /// Zero-based line.
        line: u32,
        /// Zero-based column.
        column: u32,
        /// Optional selection.
        selection: Option<Selection>,
        /// Cursor owner.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A file was created.
    FileCreated {
        /// Room.
        room_id: RoomId,
        /// The new file.
        file: FileView,
        /// Creator.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A file was deleted.
    FileDeleted {
        /// Room.
        room_id: RoomId,
        /// Deleted file.
        file_id: FileId,
        /// Its former path.
        path: String,
        /// Who deleted it.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// An external editor registered.
    EditorConnected {
        /// Room.
        room_id: RoomId,
        /// Bridge session.
        bridge_id: BridgeId,
        /// Editor kind.
        editor_type: String,
        /// Editor version.
        editor_version: String,
        /// Owner.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// An external editor went away.
    EditorDisconnected {
        /// Room.
        room_id: RoomId,
        /// Bridge session.
        bridge_id: BridgeId,
        /// Owner.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A sync batch from an external editor was applied.
    FilesSynced {
        /// Room.
        room_id: RoomId,
        /// Project.
        project_id: ProjectId,
        /// Files created.
        created: usize,
        /// Files overwritten.
        updated: usize,
        /// Files left unchanged.
        skipped: usize,
        /// Files that failed.
        failed: usize,
        /// Who synced.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A command or git operation ran on a bridge workspace.
    TeamActivity {
        /// Room.
        room_id: RoomId,
        /// Project.
        project_id: ProjectId,
        /// Command or git.
        kind: OperationKind,
        /// Command line or git operation name.
        operation: String,
        /// Combined output.
        output: String,
        /// Whether it succeeded.
        success: bool,
        /// Who ran it.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A deployment was accepted.
    DeploymentStarted {
        /// Room.
        room_id: RoomId,
        /// Deployment.
        deployment_id: DeploymentId,
        /// Project.
        project_id: ProjectId,
        /// Provider identifier.
        provider: String,
        /// Who started it.
        user: PublicUser,
        /// When.
        at: DateTime<Utc>,
    },
    /// A deployment changed stage or progress.
    DeploymentProgress {
        /// Room.
        room_id: RoomId,
        /// Deployment.
        deployment_id: DeploymentId,
        /// Current status.
        status: DeploymentStatus,
        /// Percent complete.
        progress: u8,
        /// Human-readable stage message.
        message: String,
        /// Result URL, once known.
        url: Option<String>,
        /// Failure reason, once known.
        error: Option<String>,
        /// When.
        at: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// The room an event belongs to.
    #[must_use]
    pub const fn room_id(&self) -> RoomId {
        match self {
            Self::MemberJoined { room_id, .. }
            | Self::MemberLeft { room_id, .. }
            | Self::CodeChange { room_id, .. }
            | Self::CursorUpdate { room_id, .. }
            | Self::FileCreated { room_id, .. }
            | Self::FileDeleted { room_id, .. }
            | Self::EditorConnected { room_id, .. }
            | Self::EditorDisconnected { room_id, .. }
            | Self::FilesSynced { room_id, .. }
            | Self::TeamActivity { room_id, .. }
            | Self::DeploymentStarted { room_id, .. }
            | Self::DeploymentProgress { room_id, .. } => *room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devroom_core::UserId;

    #[test]
    fn events_are_tagged_kebab_case() {
        let event = ServerEvent::MemberJoined {
            room_id: RoomId::generate(),
            user: PublicUser::anonymous(UserId::generate()),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "member-joined");
        assert!(json.get("roomId").is_some());
        assert_eq!(json["user"]["displayName"], "anonymous");
    }

    #[test]
    fn progress_fields_are_camel_case() {
        let event = ServerEvent::DeploymentProgress {
            room_id: RoomId::generate(),
            deployment_id: DeploymentId::generate(),
            status: DeploymentStatus::Building,
            progress: 40,
            message: "Running build".to_string(),
            url: None,
            error: None,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deployment-progress");
        assert_eq!(json["status"], "building");
        assert_eq!(json["progress"], 40);
        assert!(json.get("deploymentId").is_some());
    }

    #[test]
    fn topic_display() {
        let room = RoomId::from_bytes([0u8; 16]);
        assert_eq!(
            Topic::bridge(room).to_string(),
            "bridge:00000000-0000-0000-0000-000000000000"
        );
    }
}
